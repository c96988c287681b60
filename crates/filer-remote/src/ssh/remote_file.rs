//! Remote command helpers built on [`RemoteExec`]
//!
//! [`RemoteFileWriter`] replaces a file on the filer atomically: the contents
//! are streamed into `<path>.tmp`, and only once that write has finished is
//! the temp file renamed over the target. Both steps run on the same session.

use super::session::{CommandOutput, RemoteExec};
use crate::error::{Error, Result};
use crate::guard::check_ssh_injection;

/// Validate `args` against shell injection, then run them as one command.
/// With `check_exit_code`, a non-zero status becomes an error.
pub async fn ssh_execute<E>(
    session: &E,
    args: &[impl AsRef<str>],
    check_exit_code: bool,
) -> Result<CommandOutput>
where
    E: RemoteExec + ?Sized,
{
    check_ssh_injection(args)?;

    let command = args
        .iter()
        .map(|a| a.as_ref().trim())
        .collect::<Vec<_>>()
        .join(" ");
    tracing::debug!("Running remote command: {command}");

    let output = session.exec(&command, None).await?;
    if check_exit_code {
        output.check(&command)
    } else {
        Ok(output)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteFileWriter {
    root_prefix: String,
}

impl Default for RemoteFileWriter {
    fn default() -> Self {
        Self::new("sudo")
    }
}

impl RemoteFileWriter {
    /// `root_prefix` is prepended to both commands when writing as root
    pub fn new(root_prefix: impl Into<String>) -> Self {
        Self {
            root_prefix: root_prefix.into(),
        }
    }

    /// Atomically replace `path` on the remote host with `contents`.
    ///
    /// The session is left as-is on failure; whether it is still usable is
    /// for the caller to decide.
    pub async fn write<E>(
        &self,
        session: &E,
        path: &str,
        contents: &[u8],
        as_root: bool,
    ) -> Result<()>
    where
        E: RemoteExec + ?Sized,
    {
        // The path is interpolated between double quotes
        if path.contains(['"', '`', '$', '\\']) {
            return Err(Error::injection(&[path]));
        }

        let tmp_path = format!("{path}.tmp");
        let (write_cmd, rename_cmd) = if as_root {
            (
                format!("{} tee \"{tmp_path}\" > /dev/null", self.root_prefix),
                format!("{} mv -f \"{tmp_path}\" \"{path}\"", self.root_prefix),
            )
        } else {
            (
                format!("cat > \"{tmp_path}\""),
                format!("mv -f \"{tmp_path}\" \"{path}\""),
            )
        };

        tracing::debug!("Writing {} bytes to remote file {tmp_path}", contents.len());
        session
            .exec(&write_cmd, Some(contents))
            .await?
            .check(&write_cmd)?;

        tracing::debug!("Renaming remote file {tmp_path} to {path}");
        session.exec(&rename_cmd, None).await?.check(&rename_cmd)?;

        Ok(())
    }
}
