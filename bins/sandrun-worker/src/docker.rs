// Docker sandbox: `docker run` for the process, Docker API for image and kill
use crate::config::Config;
use crate::launcher::{LaunchError, Sandbox};
use crate::volume::{VolumeError, VolumeTranslator};
use bollard::container::KillContainerOptions;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Builds the `docker run` command line for one sandbox
///
/// **Invocation:** `[sudo] docker run --rm -i --name <name> -v <host>:<target> <image>`
/// - `--rm` removes the container when it exits
/// - `-i` keeps stdin attached, required for the duplex link
/// - the host path is translated for the runtime's mount syntax
#[derive(Debug, Clone)]
pub struct DockerInvocation {
    image: String,
    mount_target: String,
    use_sudo: bool,
    translator: VolumeTranslator,
}

impl DockerInvocation {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image: config.image.clone(),
            mount_target: config.mount_target.clone(),
            use_sudo: config.use_sudo,
            translator: config.translator(),
        }
    }

    /// Program and arguments for one sandbox
    fn args(&self, mount: &str, name: &str) -> (String, Vec<String>) {
        let mut args = Vec::new();
        let program = if self.use_sudo {
            args.push("docker".to_string());
            "sudo"
        } else {
            "docker"
        };

        let volume = format!("{}:{}", mount, self.mount_target);
        args.extend(
            [
                "run",
                "--rm",
                "-i",
                "--name",
                name,
                "-v",
                volume.as_str(),
                self.image.as_str(),
            ]
            .iter()
            .map(|s| s.to_string()),
        );

        (program.to_string(), args)
    }

    pub fn command(&self, workdir: &Path, name: &str) -> Result<Command, VolumeError> {
        let mount = self.translator.translate_path(workdir)?;
        let (program, args) = self.args(&mount, name);
        debug!(program = %program, args = ?args, "Sandbox command");

        let mut command = Command::new(program);
        command.args(args);
        Ok(command)
    }
}

/// Runs each sandbox through the docker CLI so its standard streams are
/// plain OS pipes; images and kills go through the Docker API
pub struct DockerCli {
    docker: Docker,
    invocation: DockerInvocation,
    pull_images: bool,
}

impl DockerCli {
    pub fn from_config(config: &Config) -> Result<Self, LaunchError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            invocation: DockerInvocation::from_config(config),
            pull_images: config.pull_images,
        })
    }

    /// Ensure the sandbox image is available (pull if needed)
    async fn ensure_image(&self) -> Result<(), LaunchError> {
        let image = self.invocation.image.as_str();
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling now");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result?;
        }

        info!(image = %image, "Image pulled successfully");
        Ok(())
    }
}

impl Sandbox for DockerCli {
    fn command(&self, workdir: &Path, name: &str) -> Result<Command, LaunchError> {
        Ok(self.invocation.command(workdir, name)?)
    }

    async fn prepare(&self) -> Result<(), LaunchError> {
        if self.pull_images {
            self.ensure_image().await?;
        }
        Ok(())
    }

    async fn terminate(&self, name: &str) {
        // --rm takes care of removal once the container stops
        if let Err(e) = self
            .docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(sandbox = %name, error = %e, "Failed to kill container");
        }
    }
}
