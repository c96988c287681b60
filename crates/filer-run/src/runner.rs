use std::path::Path;
use std::time::Duration;

use eyre::Result;
use filer_remote::guard::check_ssh_injection;
use filer_remote::retry::{RetryClassifier, RetryIfExitCode, RetryPolicy, Retrying};
use filer_remote::ssh::{ssh_execute, Endpoint, SshPool};
use filer_remote::FilerConfig;
use tokio::io::AsyncReadExt;

use crate::app::{Command, RetryArgs, Target};

pub struct Runner {
    config: FilerConfig,
}

impl Runner {
    pub fn new(config: FilerConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Exec {
                target,
                retry,
                args,
            } => self.exec(&target, &retry, &args).await,
            Command::WriteFile {
                target,
                path,
                from,
                as_root,
            } => {
                let contents = read_contents(from.as_deref()).await?;
                self.write_file(&target, &path, &contents, as_root).await
            }
            Command::Local { root, retry, args } => self.local(root, &retry, &args).await,
            Command::Check { args } => {
                check_ssh_injection(&args)?;
                println!("ok");
                Ok(())
            }
        }
    }

    fn pool(&self, target: &Target) -> Result<SshPool> {
        let mut endpoint = Endpoint::builder()
            .host(target.host.clone())
            .port(target.port)
            .build();

        if let Some(login) = &target.login {
            endpoint.login = login.clone();
        }
        endpoint.password = target.password.clone();
        endpoint.private_key = target.key.clone();
        endpoint.connect_timeout = self.config.connect_timeout();
        endpoint.known_hosts = self.config.known_hosts_path();

        Ok(SshPool::for_endpoint(endpoint, self.config.pool_config())?)
    }

    async fn exec(&self, target: &Target, retry: &RetryArgs, args: &[String]) -> Result<()> {
        check_ssh_injection(args)?;
        let pool = &self.pool(target)?;

        let output = retrying(retry)?
            .run(move || async move {
                let session = pool.acquire().await?;
                let result = ssh_execute(&session, args, true).await;
                match &result {
                    // The transport itself failed, don't hand the session out again
                    Err(filer_remote::Error::Ssh(_)) => pool.evict(session).await,
                    _ => pool.release(session),
                }
                result
            })
            .await?;

        print!("{}", output.stdout);
        eprint!("{}", output.stderr);
        pool.close().await;
        Ok(())
    }

    async fn write_file(
        &self,
        target: &Target,
        path: &str,
        contents: &[u8],
        as_root: bool,
    ) -> Result<()> {
        let pool = self.pool(target)?;
        let session = pool.acquire().await?;

        let result = self
            .config
            .remote_file_writer()
            .write(&session, path, contents, as_root)
            .await;
        pool.release(session);
        result?;

        tracing::info!("Wrote {} bytes to {}:{path}", contents.len(), target.host);
        pool.close().await;
        Ok(())
    }

    async fn local(&self, root: bool, retry: &RetryArgs, args: &[String]) -> Result<()> {
        let helper = &self.config.root_helper();
        let output = retrying(retry)?
            .run(move || helper.execute(args, root))
            .await?;

        print!("{}", output.stdout);
        eprint!("{}", output.stderr);
        Ok(())
    }
}

/// The file named by `--from`, or all of stdin
async fn read_contents(from: Option<&Path>) -> Result<Vec<u8>> {
    match from {
        Some(file) => Ok(tokio::fs::read(file).await?),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            Ok(buf)
        }
    }
}

/// Without `--retry-exit-code` every failure is retried
fn retrying(
    args: &RetryArgs,
) -> Result<Retrying<impl Fn(&filer_remote::Error) -> bool + Send + Sync>> {
    let policy = RetryPolicy::new(Duration::from_secs(args.interval), args.retries)?
        .backoff_rate(args.backoff_rate)?;

    let retry_all = args.exit_codes.is_empty();
    let exit_codes = RetryIfExitCode::new(args.exit_codes.iter().copied());
    let classifier = move |error: &filer_remote::Error| {
        retry_all || exit_codes.should_retry(error)
    };

    Ok(Retrying::new(policy, classifier))
}
