//! Host Disk Tooling
//!
//! `DiskOps` and `LvmOps` implemented with the standard Linux command-line
//! tools. When the agent runs in a container the commands can be executed
//! in the host mount namespace through `nsenter`.

use crate::domain::ports::{DiskOps, LvmOps};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Exit status `pvs`/`vgs` use when the object does not exist
const LVM_NOT_FOUND: i32 = 5;

/// Command-line backed disk and LVM operations
#[derive(Debug, Clone, Default)]
pub struct SystemDiskOps {
    /// Run every command in PID 1's mount namespace
    host_namespace: bool,
}

/// Captured result of one command
#[derive(Debug)]
struct CommandOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl SystemDiskOps {
    pub fn new(host_namespace: bool) -> Self {
        Self { host_namespace }
    }

    /// Full argv, including the namespace prefix
    fn command_line(&self, program: &str, args: &[&str]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 4);
        if self.host_namespace {
            argv.extend(["nsenter", "--mount=/proc/1/ns/mnt", "--"].map(String::from));
        }
        argv.push(program.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    async fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let argv = self.command_line(program, args);
        debug!("Running {}", argv.join(" "));

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .map_err(|e| Error::command(program, e.to_string()))?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run a command that must succeed
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.output(program, args).await?;
        if !output.success {
            return Err(Error::command(
                format!("{} {}", program, args.join(" ")),
                output.stderr,
            ));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl DiskOps for SystemDiskOps {
    async fn create_single_partition(&self, dev_path: &str, part_uuid: &str) -> Result<()> {
        self.run("sgdisk", &["--zap-all", dev_path]).await?;
        let guid = format!("--partition-guid=1:{}", part_uuid);
        self.run("sgdisk", &["--new=1:0:0", "--typecode=1:8300", &guid, dev_path])
            .await?;
        // The kernel must re-read the table before the child shows up
        self.run("partprobe", &[dev_path]).await?;
        info!("Created single GPT partition on {}", dev_path);
        Ok(())
    }

    async fn make_ext4(&self, dev_path: &str, uuid: Option<&str>) -> Result<()> {
        let mut args = vec!["-F"];
        if let Some(uuid) = uuid.filter(|u| !u.is_empty()) {
            args.extend(["-U", uuid]);
        }
        args.push(dev_path);
        self.run("mkfs.ext4", &args).await?;
        info!("Formatted {} as ext4", dev_path);
        Ok(())
    }

    async fn wipe_signatures(&self, dev_path: &str) -> Result<()> {
        self.run("wipefs", &["-a", dev_path]).await?;
        info!("Wiped signatures on {}", dev_path);
        Ok(())
    }

    async fn mount(&self, dev_path: &str, mount_point: &str) -> Result<()> {
        self.run("mkdir", &["-p", mount_point]).await?;
        self.run("mount", &[dev_path, mount_point]).await?;
        info!("Mounted {} at {}", dev_path, mount_point);
        Ok(())
    }

    async fn unmount(&self, mount_point: &str) -> Result<()> {
        let output = self.output("umount", &[mount_point]).await?;
        if !output.success && !is_not_mounted(&output.stderr) {
            return Err(Error::command(format!("umount {}", mount_point), output.stderr));
        }
        info!("Unmounted {}", mount_point);
        Ok(())
    }
}

#[async_trait]
impl LvmOps for SystemDiskOps {
    async fn is_physical_volume(&self, dev_path: &str) -> Result<bool> {
        let output = self
            .output("pvs", &["--noheadings", "-o", "pv_name", dev_path])
            .await?;
        if output.success {
            return Ok(true);
        }
        if output.code == Some(LVM_NOT_FOUND) {
            return Ok(false);
        }
        Err(Error::command(format!("pvs {}", dev_path), output.stderr))
    }

    async fn volume_group_members(&self, vg_name: &str) -> Result<Option<Vec<String>>> {
        let output = self
            .output("vgs", &["--noheadings", "-o", "vg_name", vg_name])
            .await?;
        if !output.success {
            if output.code == Some(LVM_NOT_FOUND) {
                return Ok(None);
            }
            return Err(Error::command(format!("vgs {}", vg_name), output.stderr));
        }

        let pvs = self
            .run("pvs", &["--noheadings", "-o", "pv_name,vg_name"])
            .await?;
        Ok(Some(parse_pv_members(&pvs, vg_name)))
    }

    async fn create_volume_group(
        &self,
        vg_name: &str,
        devices: &[String],
        parameters: Option<&str>,
    ) -> Result<()> {
        let mut args: Vec<&str> = parameters
            .map(|p| p.split_whitespace().collect())
            .unwrap_or_default();
        args.push(vg_name);
        args.extend(devices.iter().map(String::as_str));
        self.run("vgcreate", &args).await?;
        info!("Created volume group {} with {:?}", vg_name, devices);
        Ok(())
    }

    async fn extend_volume_group(&self, vg_name: &str, dev_path: &str) -> Result<()> {
        self.run("vgextend", &[vg_name, dev_path]).await?;
        info!("Extended volume group {} with {}", vg_name, dev_path);
        Ok(())
    }

    async fn reduce_volume_group(&self, vg_name: &str, dev_path: &str) -> Result<()> {
        self.run("vgreduce", &[vg_name, dev_path]).await?;
        info!("Removed {} from volume group {}", dev_path, vg_name);
        Ok(())
    }

    async fn remove_volume_group(&self, vg_name: &str) -> Result<()> {
        self.run("vgremove", &["-f", vg_name]).await?;
        info!("Removed volume group {}", vg_name);
        Ok(())
    }

    async fn activate_volume_group(&self, vg_name: &str, active: bool) -> Result<()> {
        let flag = if active { "-ay" } else { "-an" };
        self.run("vgchange", &[flag, vg_name]).await?;
        Ok(())
    }
}

fn is_not_mounted(stderr: &str) -> bool {
    stderr.contains("not mounted") || stderr.contains("no mount point specified")
}

/// Physical volumes of `vg_name` from `pvs -o pv_name,vg_name` output
fn parse_pv_members(output: &str, vg_name: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pv = fields.next()?;
            let vg = fields.next()?;
            (vg == vg_name).then(|| pv.to_string())
        })
        .collect()
}
