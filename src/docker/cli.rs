use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::path::Path;
use std::process::Stdio;

use super::DockerImageRepositoryOpener;

/// Extracts the image reference from `docker load` output, which is a single
/// `Loaded image: <ref>` or `Loaded image ID: <id>` line.
pub fn parse_load_output(output: &str) -> Result<String> {
    let lines: Vec<&str> = output.lines().map(str::trim).filter(|line| !line.is_empty()).collect();
    let [line] = lines.as_slice() else {
        anyhow::bail!("Expected one line of docker load output, got {}", lines.len());
    };

    let (_, loaded) = line
        .split_once(':')
        .with_context(|| format!("Unrecognised docker load output: {line}"))?;
    let loaded = loaded.trim();
    anyhow::ensure!(!loaded.is_empty(), "docker load reported an empty image: {line}");
    Ok(loaded.to_string())
}

/// Talks to the Docker engine through the `docker` executable.
#[derive(Debug, Clone)]
pub struct DockerCliOpener {
    program: String,
}

impl Default for DockerCliOpener {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerCliOpener {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    async fn output(&self, args: &[&str]) -> Result<std::process::Output> {
        tokio::process::Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| {
                if error.kind() == std::io::ErrorKind::NotFound {
                    anyhow::anyhow!("Command not found: {}", self.program)
                } else {
                    anyhow::anyhow!("Failed to spawn command '{}': {}", self.program, error)
                }
            })
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        log::debug!("Running {} {}", self.program, args.join(" "));
        let output = self.output(args).await?;
        if !output.status.success() {
            anyhow::bail!(
                "`{} {}` failed ({}): {}",
                self.program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Builds `docker_file` in `context_dir`, tags it and returns the image id.
    pub async fn build_image(&self, docker_file: &Path, tag: &str, context_dir: &Path) -> Result<String> {
        let work = tempfile::tempdir().context("Failed to create build work dir")?;
        let id_file = work.path().join("image-id");
        let docker_file = docker_file.to_string_lossy();
        let id_file_arg = id_file.to_string_lossy();
        let context = context_dir.to_string_lossy();

        self.run(&["build", "-f", &docker_file, "--iidfile", &id_file_arg, "--tag", tag, &context])
            .await?;

        let id = tokio::fs::read_to_string(&id_file)
            .await
            .with_context(|| format!("Failed to read {}", id_file.display()))?;
        let id = id.trim();
        anyhow::ensure!(!id.is_empty(), "docker build wrote an empty image id");
        Ok(id.to_string())
    }
}

#[async_trait]
impl DockerImageRepositoryOpener for DockerCliOpener {
    async fn is_image_present(&self, image: &str) -> Result<bool> {
        Ok(self.output(&["image", "inspect", image]).await?.status.success())
    }

    async fn save_image(&self, image: &str, dir: &Path) -> Result<()> {
        let work = tempfile::tempdir().context("Failed to create save work dir")?;
        let tar_path = work.path().join("image.tar");
        self.run(&["save", "-o", &tar_path.to_string_lossy(), image]).await?;

        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_plain_tar(&tar_path, &dir))
            .await
            .context("Image unpack task failed")?
    }

    async fn load_image(&self, dir: &Path) -> Result<String> {
        let work = tempfile::tempdir().context("Failed to create load work dir")?;
        let tar_path = work.path().join("image.tar");

        let dir = dir.to_path_buf();
        let tar_path_owned = tar_path.clone();
        tokio::task::spawn_blocking(move || pack_plain_tar(&dir, &tar_path_owned))
            .await
            .context("Image pack task failed")??;

        let output = self.run(&["load", "-i", &tar_path.to_string_lossy()]).await?;
        parse_load_output(&output)
    }

    async fn tag_image(&self, image: &str, tag: &str) -> Result<()> {
        self.run(&["tag", image, tag]).await.map(|_| ())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.run(&["pull", image]).await.map(|_| ())
    }
}

fn unpack_plain_tar(tar_path: &Path, dir: &Path) -> Result<()> {
    let file = File::open(tar_path).with_context(|| format!("Failed to open {}", tar_path.display()))?;
    tar::Archive::new(file)
        .unpack(dir)
        .with_context(|| format!("Failed to unpack {} into {}", tar_path.display(), dir.display()))
}

fn pack_plain_tar(dir: &Path, tar_path: &Path) -> Result<()> {
    let file = File::create(tar_path).with_context(|| format!("Failed to create {}", tar_path.display()))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("Failed to archive {}", dir.display()))?;
    builder.into_inner()?;
    Ok(())
}
