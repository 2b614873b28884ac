//! Systemd service installation for kd-agent.
//!
//! The unit file points to the binary and config at their current
//! absolute paths -- no files are copied.

use std::path::Path;
use std::process::Command;

const UNIT_PATH: &str = "/etc/systemd/system/kd-agent.service";
const SERVICE_NAME: &str = "kd-agent";

/// Install kd-agent as a systemd service. Must be run as root.
pub fn install_service(config_path: &Path) -> anyhow::Result<()> {
    if !is_systemd_available() {
        anyhow::bail!("systemd not available");
    }
    if !is_root() {
        anyhow::bail!("root required, use: sudo kd-agent install");
    }

    let exe_path = std::env::current_exe()?.canonicalize()?;
    let exe_str = exe_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("binary path contains invalid UTF-8"))?;

    let config_abs = std::fs::canonicalize(config_path)
        .unwrap_or_else(|_| config_path.to_path_buf());
    let config_str = config_abs
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("config path contains invalid UTF-8"))?;

    let working_dir = config_abs
        .parent()
        .unwrap_or_else(|| Path::new("/"))
        .to_str()
        .unwrap_or("/");

    if Path::new(UNIT_PATH).exists() {
        eprintln!("  Stopping existing service...");
        let _ = Command::new("systemctl")
            .args(["stop", SERVICE_NAME])
            .status();
    }

    eprintln!("  Generating systemd unit file...");
    eprintln!("    Binary:  {}", exe_str);
    eprintln!("    Config:  {}", config_str);
    eprintln!("    WorkDir: {}", working_dir);

    let unit_content = format!(
        "[Unit]\n\
         Description=kd-agent SSH access provisioning agent\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         WorkingDirectory={working_dir}\n\
         Environment=KD_AGENT_CONFIG={config_str}\n\
         ExecStart={exe_str} start\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         LimitNOFILE=65535\n\
         UMask=0077\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
    );
    std::fs::write(UNIT_PATH, &unit_content)?;

    eprintln!("  Enabling and starting service...");
    run_cmd("systemctl", &["daemon-reload"])?;
    run_cmd("systemctl", &["enable", "--now", SERVICE_NAME])?;

    eprintln!();
    let output = Command::new("systemctl")
        .args(["is-active", SERVICE_NAME])
        .output()?;
    let state = String::from_utf8_lossy(&output.stdout).trim().to_string();

    if state == "active" {
        eprintln!("  Service started successfully!");
    } else {
        eprintln!("  Service state: {} (check `journalctl -u {SERVICE_NAME}`)", state);
    }

    eprintln!();
    eprintln!("  Commands:");
    eprintln!("    kd-agent status             # service status");
    eprintln!("    sudo kd-agent uninstall     # remove service");
    eprintln!();

    Ok(())
}

fn is_systemd_available() -> bool {
    Command::new("systemctl")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub(crate) fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Whether a systemd unit file is currently installed.
pub fn is_installed() -> bool {
    Path::new(UNIT_PATH).exists()
}

/// Remove the systemd service.
pub fn uninstall_service() -> anyhow::Result<()> {
    if !is_root() {
        anyhow::bail!("root required, use: sudo kd-agent uninstall");
    }
    if !Path::new(UNIT_PATH).exists() {
        eprintln!("  Service not installed, nothing to do.");
        return Ok(());
    }

    eprintln!("  Stopping and removing existing service...");
    let _ = Command::new("systemctl")
        .args(["disable", "--now", SERVICE_NAME])
        .status();

    std::fs::remove_file(UNIT_PATH)?;
    eprintln!("  Removed {}", UNIT_PATH);
    run_cmd("systemctl", &["daemon-reload"])?;
    eprintln!("  Service uninstalled.");
    eprintln!();
    eprintln!("  Config file and key material are preserved. Remove manually if needed.");

    Ok(())
}

/// Check if the systemd service is currently active.
pub fn is_service_active() -> bool {
    Path::new(UNIT_PATH).exists()
        && Command::new("systemctl")
            .args(["is-active", "--quiet", SERVICE_NAME])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
}

/// `kd-agent status` -- show service and key-material status.
pub fn cmd_status(key_path: &Path) -> anyhow::Result<()> {
    let installed = is_installed();
    println!("service installed: {installed}");
    if installed {
        println!("service active:    {}", is_service_active());
    }
    println!(
        "key material:      {}",
        if key_path.join("jwk.private.json").exists() {
            "present"
        } else {
            "missing"
        }
    );

    if installed {
        let _ = Command::new("systemctl")
            .args(["status", SERVICE_NAME, "--no-pager"])
            .status();
    }
    Ok(())
}

pub(crate) fn run_cmd(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let display = format!("{} {}", program, args.join(" "));
    eprintln!("  > {}", display);

    let status = Command::new(program).args(args).status()?;
    if !status.success() {
        anyhow::bail!("command failed: {}", display);
    }
    Ok(())
}
