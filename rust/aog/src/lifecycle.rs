//! Process lifecycle: PID file, stop, daemonization.

use std::path::Path;

use crate::config::AppConfig;

/// Write the current process id to the PID file.
pub fn write_pid(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())
}

/// Read the PID file, if present and parseable.
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Remove the PID file. Missing files are fine.
pub fn remove_pid(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

/// Stop a running gateway.
///
/// Tries the HTTP shutdown hook first (the only option on Windows); falls
/// back to SIGTERM through the PID file on Unix.
pub async fn stop(config: &AppConfig) -> anyhow::Result<()> {
    let url = format!(
        "http://{}/_internal/shutdown",
        config.server.bind_addr()
    );
    let client = reqwest::Client::new();
    let hook = client
        .post(&url)
        .timeout(std::time::Duration::from_secs(5))
        .send()
        .await;

    match hook {
        Ok(response) if response.status().is_success() => {
            println!("Gateway stopping");
            return Ok(());
        }
        Ok(response) => {
            tracing::debug!(status = %response.status(), "Shutdown hook rejected");
        }
        Err(e) => {
            tracing::debug!(error = %e, "Shutdown hook unreachable");
        }
    }

    #[cfg(unix)]
    {
        let pid_path = config.paths.pid_path();
        let Some(pid) = read_pid(&pid_path) else {
            anyhow::bail!("gateway does not appear to be running (no PID file, hook unreachable)");
        };
        let status = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()?;
        if !status.success() {
            anyhow::bail!("kill -TERM {pid} failed");
        }
        println!("Sent SIGTERM to {pid}");
        Ok(())
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("gateway does not appear to be running (shutdown hook unreachable)")
    }
}

/// Re-exec the gateway detached, with stdio redirected to the console log.
///
/// The child runs `server start` with `AOG_DAEMONIZED` set so it does not
/// daemonize again; the parent prints the child PID and returns.
pub fn daemonize(config: &AppConfig, verbose: bool) -> anyhow::Result<()> {
    config.ensure_dirs()?;
    let console_log = config.paths.log_dir().join("console.log");
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&console_log)?;
    let log_err = log.try_clone()?;

    let exe = std::env::current_exe()?;
    let mut command = std::process::Command::new(exe);
    command
        .args(if verbose {
            vec!["server", "start", "--verbose"]
        } else {
            vec!["server", "start"]
        })
        .env("AOG_DAEMONIZED", "1")
        .stdin(std::process::Stdio::null())
        .stdout(log)
        .stderr(log_err);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Detach from the controlling terminal's process group.
        command.process_group(0);
    }

    let child = command.spawn()?;
    println!(
        "Gateway started in the background (pid {}), logs at {}",
        child.id(),
        console_log.display()
    );
    Ok(())
}

/// Whether this process was launched by [`daemonize`].
pub fn is_daemon_child() -> bool {
    std::env::var("AOG_DAEMONIZED").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aog.pid");

        write_pid(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));

        remove_pid(&path);
        assert_eq!(read_pid(&path), None);
        // Removing again is fine.
        remove_pid(&path);
    }

    #[test]
    fn test_read_pid_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aog.pid");
        std::fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pid(&path), None);
    }
}
