mod archive;
mod config;
mod connector;
mod error;
mod fs;
mod handle_table;
mod registry;
mod request;
#[cfg(test)]
mod testing;
mod util;

use anyhow::Context;
use archive::ZipProvider;
use clap::Parser;
use config::Config;
use connector::MountRouter;
use fs::MultiZipFs;
use fuse3::MountOptions;
use fuse3::path::Session;
#[cfg(unix)]
use futures_util::future::poll_fn;
use registry::{CONFIG_DIR, MountRegistry};
use std::path::PathBuf;
#[cfg(unix)]
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
#[cfg(unix)]
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "multizipfs-rs")]
#[command(about = "FUSE3 namespace that mounts zip archives written to config/<name>")]
struct Cli {
    /// Mount point for the virtual filesystem.
    mountpoint: PathBuf,

    /// Allow other users to access the mount (passes allow_other to FUSE).
    #[arg(long, default_value_t = false)]
    allow_other: bool,

    /// Permit mounting on a non-empty directory.
    #[arg(long, default_value_t = false)]
    nonempty: bool,

    /// Attribute and entry TTL handed to the kernel, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    attr_ttl_ms: u64,

    /// Largest single write accepted, in KiB.
    #[arg(long, default_value_t = 128)]
    max_write_kb: u32,

    /// Mount an archive at startup, as NAME=PATH. May be repeated.
    #[arg(long = "preload", value_parser = parse_preload)]
    preloads: Vec<(String, PathBuf)>,
}

fn parse_preload(value: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got `{value}`"))?;
    if name.is_empty() || name.contains('/') || name == CONFIG_DIR {
        return Err(format!("invalid mount name `{name}`"));
    }
    Ok((name.to_owned(), PathBuf::from(path)))
}

/// Runs each preload through the same create + write sequence a client
/// would use. Failures are logged and skipped.
fn preload(registry: &Arc<MountRegistry>, preloads: &[(String, PathBuf)]) {
    for (name, path) in preloads {
        let result = registry
            .create(&format!("{CONFIG_DIR}/{name}"), 0, 0o600)
            .and_then(|request| request.write(path.as_os_str().as_encoded_bytes()));
        match result {
            Ok(_) => info!(name = %name, path = %path.display(), "preloaded archive"),
            Err(err) => {
                warn!(name = %name, path = %path.display(), error = %err, "preload failed")
            }
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = Config::from_process(Duration::from_millis(cli.attr_ttl_ms), cli.max_write_kb);

    let registry = Arc::new(MountRegistry::new(Arc::new(ZipProvider)));
    registry.bind(Arc::new(MountRouter::new()));
    preload(&registry, &cli.preloads);

    let fs = MultiZipFs::new(config, registry);

    let mut mount_opts = MountOptions::default();
    mount_opts.fs_name("multizipfs-rs");
    mount_opts.allow_other(cli.allow_other);
    mount_opts.nonempty(cli.nonempty);

    let session = Session::new(mount_opts);
    let handle = session
        .mount(fs, cli.mountpoint.clone())
        .await
        .with_context(|| format!("mounting at {}", cli.mountpoint.display()))?;
    info!(mountpoint = %cli.mountpoint.display(), "mounted");

    #[cfg(unix)]
    {
        // Listen for termination signals and unmount cleanly before exiting.
        let (unmount_tx, unmount_rx) = oneshot::channel::<()>();

        let mut mount_task = tokio::spawn(async move {
            let mut handle = Some(handle);
            let mut handle_future = poll_fn(|cx| match handle.as_mut() {
                Some(handle) => Pin::new(handle).poll(cx),
                None => std::task::Poll::Pending,
            });

            let res = tokio::select! {
                res = &mut handle_future => res,
                _ = unmount_rx => {
                    match handle.take() {
                        Some(handle) => handle.unmount().await,
                        None => Ok(()),
                    }
                }
            };

            res.map_err(anyhow::Error::from)
        });

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let signals = async {
            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
        };
        tokio::pin!(signals);

        let result = tokio::select! {
            res = &mut mount_task => res,
            _ = &mut signals => {
                info!("signal received, unmounting");
                let _ = unmount_tx.send(());
                mount_task.await
            }
        };

        result??;
    }

    #[cfg(not(unix))]
    {
        // Block until the filesystem is unmounted. This keeps the
        // process alive instead of exiting immediately after mount.
        handle.await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, RecordingConnector};

    #[test]
    fn preload_arguments() {
        assert_eq!(
            parse_preload("photos=/data/photos.zip").unwrap(),
            ("photos".to_owned(), PathBuf::from("/data/photos.zip"))
        );
        assert!(parse_preload("no-separator").is_err());
        assert!(parse_preload("=/a.zip").is_err());
        assert!(parse_preload("a/b=/a.zip").is_err());
        assert!(parse_preload("config=/a.zip").is_err());
    }

    #[test]
    fn preload_skips_failures() {
        let registry = Arc::new(MountRegistry::new(Arc::new(FakeProvider::accepting(&[
            "/good.zip",
        ]))));
        registry.bind(Arc::new(RecordingConnector::default()));

        preload(
            &registry,
            &[
                ("good".to_owned(), PathBuf::from("/good.zip")),
                ("bad".to_owned(), PathBuf::from("/bad.zip")),
            ],
        );

        assert_eq!(registry.mounted_source("good").as_deref(), Some("/good.zip"));
        assert!(!registry.is_pending("bad"));
    }
}
