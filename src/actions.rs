use log::debug;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{cmd}: exec failed: {err}")]
    ExecFailed { cmd: String, err: std::io::Error },
    #[error("{cmd}: exit code {code}")]
    CommandFailed { cmd: String, code: i32 },
    #[error("{cmd}: write to stdin failed: {err}")]
    StdinFailed { cmd: String, err: std::io::Error },
}

/// Run a command to completion.
pub async fn run<S: AsRef<str>>(cmd: &str, args: &[S]) -> Result {
    let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
    debug!("exec: {cmd} {}", args.join(" "));

    let s = (Command::new(cmd).args(&args).stdin(Stdio::null()).status().await)
        .map_err(|err| Error::ExecFailed {
            cmd: cmd.to_string(),
            err,
        })?;

    check_status(cmd, s)
}

/// Run a command to completion, feeding it `input` on stdin.
pub async fn pipe<S: AsRef<str>>(cmd: &str, args: &[S], input: Vec<u8>) -> Result {
    debug!("exec: {cmd} ({} bytes on stdin)", input.len());

    let mut child = (Command::new(cmd).args(args.iter().map(|a| a.as_ref())))
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|err| Error::ExecFailed {
            cmd: cmd.to_string(),
            err,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        let write = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        };
        if let Err(err) = write.await {
            // still reap the child
            let _ = child.wait().await;
            return Err(Error::StdinFailed {
                cmd: cmd.to_string(),
                err,
            });
        }
    }

    let s = child.wait().await.map_err(|err| Error::ExecFailed {
        cmd: cmd.to_string(),
        err,
    })?;

    check_status(cmd, s)
}

fn check_status(cmd: &str, s: std::process::ExitStatus) -> Result {
    if !s.success() {
        return Err(Error::CommandFailed {
            cmd: cmd.to_string(),
            code: s.code().unwrap_or(0),
        });
    }
    Ok(())
}
