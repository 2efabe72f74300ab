use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{
    config::ProjectConfig,
    error::Result,
    exec::{CommandRunner, CommandSpec},
};

const ENGINE_PROGRAM: &str = "docker";
const CONTAINER_WORKSPACE: &str = "/workspace";
const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Everything needed to launch the development container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLaunch {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Host directory bind-mounted at `/workspace`.
    pub workspace: PathBuf,
    /// Home of the unprivileged user inside the container.
    pub container_home: PathBuf,
    /// Host `DISPLAY`, forwarded as-is.
    pub display: Option<String>,
    /// Host X authority file.
    pub xauthority: Option<PathBuf>,
}

impl ContainerLaunch {
    /// Builds a launch from project settings and the host environment.
    pub fn from_config(config: &ProjectConfig, workspace: &Path) -> Self {
        let xauthority = std::env::var_os("XAUTHORITY")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".Xauthority")));
        Self {
            name: config.container_name.clone(),
            image: config.image.clone(),
            workspace: workspace.to_path_buf(),
            container_home: config.home_dir(),
            display: std::env::var("DISPLAY").ok(),
            xauthority,
        }
    }
}

/// Thin wrapper over the container engine CLI.
pub struct ContainerEngine<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> ContainerEngine<R> {
    /// Constructs an engine wrapper.
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Builds `image` from `dockerfile` in `context`.
    pub fn build(&self, image: &str, dockerfile: &str, context: &Path) -> Result<()> {
        self.runner
            .interactive(
                &CommandSpec::new(ENGINE_PROGRAM)
                    .args(["build", "-t", image, "-f", dockerfile])
                    .arg(context),
            )?
            .into_result()?;
        Ok(())
    }

    /// Force-removes a container. Returns false when none was removed.
    pub fn remove(&self, name: &str) -> bool {
        match self
            .runner
            .output(&CommandSpec::new(ENGINE_PROGRAM).args(["rm", "-f", name]))
        {
            Ok(output) => output.ok_or_ignore("remove container"),
            Err(error) => {
                debug!(%error, "container engine unavailable");
                false
            }
        }
    }

    /// Starts the privileged, host-networked container in the background.
    pub fn run(&self, launch: &ContainerLaunch) -> Result<()> {
        self.runner.output(&run_spec(launch))?.into_result()?;
        Ok(())
    }

    /// Opens an interactive shell in the container and returns its exit code.
    pub fn enter(&self, name: &str) -> Result<i32> {
        let output = self.runner.interactive(
            &CommandSpec::new(ENGINE_PROGRAM).args(["exec", "-it", name, "bash"]),
        )?;
        Ok(output.code.unwrap_or(1))
    }
}

/// `docker run` invocation for `launch`.
pub fn run_spec(launch: &ContainerLaunch) -> CommandSpec {
    let container_xauthority = launch.container_home.join(".Xauthority");
    let mut spec = CommandSpec::new(ENGINE_PROGRAM).args([
        "run",
        "-d",
        "--name",
        launch.name.as_str(),
        "--privileged",
        "--network",
        "host",
    ]);
    if let Some(display) = &launch.display {
        spec = spec
            .arg("-e")
            .arg(format!("DISPLAY={display}"))
            .arg("-e")
            .arg(format!("XAUTHORITY={}", container_xauthority.display()))
            .arg("-v")
            .arg(format!("{X11_SOCKET_DIR}:{X11_SOCKET_DIR}"));
        if let Some(xauthority) = launch.xauthority.as_ref().filter(|path| path.exists()) {
            spec = spec.arg("-v").arg(format!(
                "{}:{}",
                xauthority.display(),
                container_xauthority.display()
            ));
        }
    }
    spec.arg("-v")
        .arg(format!(
            "{}:{CONTAINER_WORKSPACE}",
            launch.workspace.display()
        ))
        .args(["-w", CONTAINER_WORKSPACE])
        .arg(&launch.image)
        .args(["sleep", "infinity"])
}
