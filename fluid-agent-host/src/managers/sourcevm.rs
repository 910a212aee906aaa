//! Source VMs: long-lived libvirt domains exposed read-only to the kernel
//!
//! Discovery goes through `virsh`. Commands run over SSH as the
//! `fluid-readonly` user, after a client-side allowlist check.

use super::{ManagerError, ManagerResult, SourceVmManager};
use crate::config::SshConfig;
use crate::execution::{run_ssh, run_tool, SshTarget};
use async_trait::async_trait;
use fluid_protocol::{SourceCommandResult, SourceVmInfo, SourceVmPrepared, SourceVmValidation};
use std::time::Duration;
use tracing::{info, warn};

pub const READONLY_USER: &str = "fluid-readonly";
const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(30);
const PREPARE_TIMEOUT: Duration = Duration::from_secs(60);
const VALIDATE_SSH_TIMEOUT: Duration = Duration::from_secs(10);

const ALLOWED_COMMANDS: &[&str] = &[
    "cat", "ls", "head", "tail", "grep", "find", "stat", "df", "du", "ps", "uname", "whoami", "id",
    "hostname", "uptime", "free", "ip", "ss", "journalctl", "base64", "wc", "sort", "uniq", "file",
    "lsblk", "mount", "env", "date", "systemctl",
];
const SYSTEMCTL_READ_VERBS: &[&str] = &["status", "show", "is-active", "is-enabled", "list-units"];

/// Exit code reported when a command is refused before reaching the VM.
pub const REJECTED_EXIT_CODE: i32 = 126;

/// Accepts pipelines of read-only tools; no chaining, redirection or substitution.
pub fn validate_read_only_command(command: &str) -> Result<(), String> {
    if command.trim().is_empty() {
        return Err("empty command".into());
    }
    for forbidden in [";", "&", ">", "<", "`", "$(", "\n"] {
        if command.contains(forbidden) {
            return Err(format!("forbidden token {forbidden:?}"));
        }
    }
    for segment in command.split('|') {
        let mut words = segment.split_whitespace();
        let Some(program) = words.next() else {
            return Err("empty pipeline segment".into());
        };
        if !ALLOWED_COMMANDS.contains(&program) {
            return Err(format!("command {program:?} is not allowed"));
        }
        if program == "systemctl" && !words.next().is_some_and(|verb| SYSTEMCTL_READ_VERBS.contains(&verb)) {
            return Err("only read-only systemctl verbs are allowed".into());
        }
    }
    Ok(())
}

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Prepare script run as an admin user; prints one marker per completed step.
fn prepare_script(public_key: &str) -> String {
    format!(
        r#"set -e
if ! id {user} >/dev/null 2>&1; then sudo useradd -m -s /bin/rbash {user}; echo FLUID_USER_CREATED; fi
sudo usermod -s /bin/rbash {user} && echo FLUID_SHELL_INSTALLED
sudo install -d -m 700 -o {user} /home/{user}/.ssh
echo {key} | sudo tee /home/{user}/.ssh/authorized_keys >/dev/null && echo FLUID_KEY_INSTALLED
printf 'Match User {user}\n  AllowTcpForwarding no\n  X11Forwarding no\n' | sudo tee /etc/ssh/sshd_config.d/fluid-readonly.conf >/dev/null && echo FLUID_SSHD_CONFIGURED
(sudo systemctl reload sshd || sudo systemctl reload ssh) >/dev/null 2>&1 && echo FLUID_SSHD_RESTARTED
"#,
        user = READONLY_USER,
        key = shell_quote(public_key.trim()),
    )
}

pub fn parse_prepare_markers(vm: &str, ip: &str, stdout: &str) -> SourceVmPrepared {
    let has = |marker: &str| stdout.lines().any(|l| l.trim() == marker);
    SourceVmPrepared {
        source_vm: vm.to_string(),
        ip_address: ip.to_string(),
        prepared: has("FLUID_SHELL_INSTALLED") && has("FLUID_KEY_INSTALLED"),
        user_created: has("FLUID_USER_CREATED"),
        shell_installed: has("FLUID_SHELL_INSTALLED"),
        ca_key_installed: has("FLUID_KEY_INSTALLED"),
        sshd_configured: has("FLUID_SSHD_CONFIGURED"),
        principals_created: false,
        sshd_restarted: has("FLUID_SSHD_RESTARTED"),
    }
}

/// MAC (5th column) of the first interface row.
pub fn parse_domiflist_mac(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        (fields.len() >= 5 && fields[0] != "Interface" && !line.trim_start().starts_with("---"))
            .then(|| fields[4].to_string())
    })
}

/// First non-loopback address of `virsh domifaddr`.
pub fn parse_domifaddr_ip(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return None;
        }
        let ip = fields[3].split('/').next()?;
        (!ip.is_empty() && ip.contains('.') && !ip.starts_with("127.")).then(|| ip.to_string())
    })
}

pub struct LibvirtSourceVmManager {
    libvirt_uri: String,
    ssh: SshConfig,
}

impl LibvirtSourceVmManager {
    pub fn new(libvirt_uri: &str, ssh: SshConfig) -> Self {
        Self { libvirt_uri: libvirt_uri.to_string(), ssh }
    }

    async fn virsh(&self, args: &[&str]) -> ManagerResult<String> {
        let mut all = vec!["-c", self.libvirt_uri.as_str()];
        all.extend_from_slice(args);
        run_tool("virsh", &all).await
    }

    async fn vm_state(&self, vm: &str) -> ManagerResult<String> {
        Ok(self.virsh(&["domstate", vm]).await?.trim().to_string())
    }

    async fn vm_mac(&self, vm: &str) -> ManagerResult<String> {
        let out = self.virsh(&["domiflist", vm]).await?;
        parse_domiflist_mac(&out).ok_or_else(|| ManagerError::NotFound(format!("MAC address of {vm}")))
    }

    async fn vm_ip(&self, vm: &str) -> ManagerResult<String> {
        let out = match self.virsh(&["domifaddr", vm, "--source", "lease"]).await {
            Ok(out) => out,
            Err(_) => self.virsh(&["domifaddr", vm, "--source", "agent"]).await?,
        };
        parse_domifaddr_ip(&out).ok_or_else(|| ManagerError::NotFound(format!("IP address of {vm}")))
    }

    fn readonly_target(&self, ip: String) -> SshTarget {
        SshTarget {
            user: READONLY_USER.to_string(),
            host: ip,
            key_path: self.ssh.key_path.clone(),
            proxy_jump: self.ssh.proxy_jump.clone(),
        }
    }
}

#[async_trait]
impl SourceVmManager for LibvirtSourceVmManager {
    async fn prepare_source_vm(&self, vm: &str, ssh_user: &str, ssh_key_path: &str) -> ManagerResult<SourceVmPrepared> {
        let ip = self.vm_ip(vm).await?;
        let pub_key_path = format!("{}.pub", self.ssh.key_path);
        let public_key = tokio::fs::read_to_string(&pub_key_path)
            .await
            .map_err(|e| ManagerError::Invalid(format!("agent public key {pub_key_path}: {e}")))?;

        let admin = SshTarget {
            user: if ssh_user.is_empty() { self.ssh.default_user.clone() } else { ssh_user.to_string() },
            host: ip.clone(),
            key_path: if ssh_key_path.is_empty() { self.ssh.key_path.clone() } else { ssh_key_path.to_string() },
            proxy_jump: self.ssh.proxy_jump.clone(),
        };
        let result = run_ssh(&admin, &prepare_script(&public_key), PREPARE_TIMEOUT).await?;
        let prepared = parse_prepare_markers(vm, &ip, &result.stdout);
        if result.exit_code != 0 && !prepared.prepared {
            return Err(ManagerError::CommandFailed {
                command: format!("prepare {vm}"),
                stderr: result.stderr.trim().to_string(),
            });
        }
        info!("source VM {} prepared ({})", vm, ip);
        Ok(prepared)
    }

    async fn run_source_command(&self, vm: &str, command: &str, timeout: Duration) -> ManagerResult<SourceCommandResult> {
        if let Err(reason) = validate_read_only_command(command) {
            return Err(ManagerError::Invalid(format!("command validation (exit {REJECTED_EXIT_CODE}): {reason}")));
        }
        let ip = self.vm_ip(vm).await?;
        let timeout = if timeout.is_zero() { DEFAULT_SOURCE_TIMEOUT } else { timeout };
        let result = run_ssh(&self.readonly_target(ip), command, timeout).await?;
        Ok(SourceCommandResult {
            source_vm: vm.to_string(),
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    async fn read_source_file(&self, vm: &str, path: &str) -> ManagerResult<String> {
        let result = self
            .run_source_command(vm, &format!("base64 {}", shell_quote(path)), DEFAULT_SOURCE_TIMEOUT)
            .await?;
        if result.exit_code != 0 {
            return Err(ManagerError::CommandFailed {
                command: format!("read {path}"),
                stderr: format!("exit {}: {}", result.exit_code, result.stderr.trim()),
            });
        }
        Ok(result.stdout)
    }

    async fn list_vms(&self) -> ManagerResult<Vec<SourceVmInfo>> {
        let out = self.virsh(&["list", "--all", "--name"]).await?;
        let mut vms = Vec::new();
        for name in out.lines().map(str::trim).filter(|n| !n.is_empty() && !n.starts_with("sbx-")) {
            let state = self.vm_state(name).await.unwrap_or_default();
            let ip_address = if state == "running" { self.vm_ip(name).await.unwrap_or_default() } else { String::new() };
            vms.push(SourceVmInfo { name: name.to_string(), state, ip_address, prepared: false });
        }
        Ok(vms)
    }

    async fn validate_source_vm(&self, vm: &str) -> ManagerResult<SourceVmValidation> {
        let mut result = SourceVmValidation { source_vm: vm.to_string(), ..Default::default() };

        match self.vm_state(vm).await {
            Ok(state) => result.state = state,
            Err(e) => {
                result.errors.push(format!("VM not found: {e}"));
                return Ok(result);
            }
        }
        if result.state != "running" {
            result.errors.push("VM is not running".into());
            return Ok(result);
        }

        match self.vm_mac(vm).await {
            Ok(mac) => {
                result.mac_address = mac;
                result.has_network = true;
            }
            Err(_) => result.warnings.push("Could not determine MAC address".into()),
        }
        match self.vm_ip(vm).await {
            Ok(ip) => result.ip_address = ip,
            Err(_) => result.warnings.push("Could not determine IP address".into()),
        }

        if !result.ip_address.is_empty() && !self.ssh.key_path.is_empty() {
            let check = run_ssh(&self.readonly_target(result.ip_address.clone()), "whoami", VALIDATE_SSH_TIMEOUT).await;
            if !matches!(check, Ok(ref r) if r.exit_code == 0) {
                warn!("ssh check of {} as {} failed", vm, READONLY_USER);
                result.warnings.push(format!("SSH as {READONLY_USER} failed - VM may not be prepared"));
            }
        }

        result.valid = result.errors.is_empty() && result.has_network && !result.ip_address.is_empty();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_read_only_command() {
        assert!(validate_read_only_command("cat /etc/os-release").is_ok());
        assert!(validate_read_only_command("ps aux | grep nginx | wc -l").is_ok());
        assert!(validate_read_only_command("systemctl status nginx").is_ok());

        assert!(validate_read_only_command("").is_err());
        assert!(validate_read_only_command("rm -rf /").is_err());
        assert!(validate_read_only_command("cat a; rm b").is_err());
        assert!(validate_read_only_command("cat a > b").is_err());
        assert!(validate_read_only_command("echo $(id)").is_err());
        assert!(validate_read_only_command("systemctl restart nginx").is_err());
        assert!(validate_read_only_command("ls |").is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/hosts"), "'/etc/hosts'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert!(validate_read_only_command(&format!("base64 {}", shell_quote("/var/log/app.log"))).is_ok());
    }

    #[test]
    fn test_parse_virsh_outputs() {
        let iflist = " Interface   Type      Source    Model    MAC\n---------------\n vnet0  network  default  virtio  52:54:00:aa:bb:cc\n";
        assert_eq!(parse_domiflist_mac(iflist).as_deref(), Some("52:54:00:aa:bb:cc"));

        let addr = " Name       MAC address          Protocol     Address\n\
                    -------------------------------------------------------------\n\
                    lo         00:00:00:00:00:00    ipv4         127.0.0.1/8\n\
                    vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.10/24\n";
        assert_eq!(parse_domifaddr_ip(addr).as_deref(), Some("192.168.122.10"));
        assert_eq!(parse_domifaddr_ip(""), None);
    }

    #[test]
    fn test_parse_prepare_markers() {
        let out = "FLUID_USER_CREATED\nFLUID_SHELL_INSTALLED\nFLUID_KEY_INSTALLED\nFLUID_SSHD_CONFIGURED\n";
        let p = parse_prepare_markers("golden", "10.0.0.2", out);
        assert!(p.prepared && p.user_created && p.shell_installed && p.ca_key_installed && p.sshd_configured);
        assert!(!p.sshd_restarted);
        assert_eq!(p.ip_address, "10.0.0.2");

        assert!(!parse_prepare_markers("golden", "", "FLUID_USER_CREATED\n").prepared);
    }
}
