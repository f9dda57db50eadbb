//! `rein control <task> <command...>`: talk to a running task.

use rein_core::control::socket_path;
use rein_core::ReinConfig;

pub async fn control(config: &ReinConfig, task_id: &str, command: &[String]) -> Result<(), String> {
    let line = command.join(" ");
    if line.trim().is_empty() {
        return Err("No command given (try: status, list, pause, resume, cancel)".to_string());
    }
    let path = socket_path(&config.socket_dir(), task_id);
    if !path.exists() {
        return Err(format!(
            "No control socket for task {} at {} (is it running?)",
            task_id,
            path.display()
        ));
    }
    let reply = send(&path, &line).await?;
    println!("{}", reply);
    if reply.starts_with("ERR") {
        return Err(format!("Command '{}' rejected", line));
    }
    Ok(())
}

#[cfg(unix)]
async fn send(path: &std::path::Path, line: &str) -> Result<String, String> {
    rein_core::control::send_command(path, line)
        .await
        .map_err(|e| e.to_string())
}

#[cfg(not(unix))]
async fn send(_path: &std::path::Path, _line: &str) -> Result<String, String> {
    Err("Control sockets need a Unix platform".to_string())
}
