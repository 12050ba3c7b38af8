use super::*;
use crate::report::ApplicationId;
use crate::spec::FileKind;
use dashmap::DashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use url::Url;

/// Cluster backend that runs containers as processes on the local machine.
///
/// Allocation always succeeds immediately, so this backend is only useful for
/// standalone execution and development; it deliberately reuses the exact
/// interface the yarn protocols sit behind.
pub struct LocalCluster {
    app_id: ApplicationId,
    sink: ClusterEventSink,
    maximum: Resources,
    workdir: PathBuf,
    next_container: AtomicU64,
    kills: Arc<DashMap<YarnContainerId, oneshot::Sender<()>>>,
}

impl LocalCluster {
    pub fn new(
        app_id: ApplicationId,
        sink: ClusterEventSink,
        workdir: PathBuf,
        maximum: Resources,
    ) -> SkeinResult<Arc<Self>> {
        std::fs::create_dir_all(&workdir)
            .map_err(|err| eyre!("failed to create workdir `{}`: {}", workdir.display(), err))?;
        Ok(Arc::new(Self {
            app_id,
            sink,
            maximum,
            workdir,
            next_container: AtomicU64::new(0),
            kills: Arc::new(DashMap::new()),
        }))
    }

    fn next_id(&self) -> YarnContainerId {
        let seq = self.next_container.fetch_add(1, Ordering::SeqCst) + 1;
        YarnContainerId(format!(
            "container_{}_{:04}_01_{:06}",
            self.app_id.cluster_timestamp, self.app_id.seq, seq
        ))
    }

    async fn localize(&self, dir: &PathBuf, dest: &str, file: &File) -> SkeinResult<()> {
        let url = Url::parse(&file.source)?;
        if url.scheme() != "file" {
            bail!("local cluster cannot localize `{}`: only file:// sources are supported", file.source);
        }
        let source = url
            .to_file_path()
            .map_err(|()| eyre!("file source `{}` is not a local path", file.source))?;
        tokio::fs::metadata(&source)
            .await
            .map_err(|err| eyre!("file source `{}` is not accessible: {}", source.display(), err))?;
        let target = dir.join(dest);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if file.kind() == FileKind::Archive {
            // TODO: extract archives instead of linking them in place.
            debug!(source = %source.display(), "linking archive without extraction");
        }
        tokio::fs::symlink(&source, &target).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterInterface for LocalCluster {
    async fn register(&self, addr: SocketAddr, tracking_url: &str) -> SkeinResult<Registration> {
        info!(%addr, tracking_url, "registered application master with local cluster");
        Ok(Registration { maximum_resources: self.maximum })
    }

    async fn unregister(&self, final_status: FinalStatus, diagnostics: &str) -> SkeinResult<()> {
        info!(%final_status, diagnostics, "unregistered application master");
        Ok(())
    }

    async fn request_containers(&self, requests: &[Resources]) -> SkeinResult<()> {
        let allocations = requests
            .iter()
            .map(|&resources| Allocation { id: self.next_id(), resources })
            .collect::<Vec<_>>();
        let _ = self.sink.send(ClusterEvent::ContainersAllocated(allocations));
        Ok(())
    }

    async fn release_container(&self, id: &YarnContainerId) -> SkeinResult<()> {
        debug!(%id, "released container");
        Ok(())
    }

    async fn launch_container(&self, id: &YarnContainerId, ctx: LaunchContext) -> SkeinResult<()> {
        let dir = self.workdir.join(id.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        for (dest, file) in &ctx.files {
            self.localize(&dir, dest, file).await?;
        }

        // Commands run in order, each one only if the previous succeeded.
        let script = ctx.commands.join(" && ");
        let stdout = std::fs::File::create(dir.join("container.out"))?;
        let stderr = std::fs::File::create(dir.join("container.err"))?;
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&script)
            .current_dir(&dir)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|err| eyre!("failed to launch container `{}`: {}", id, err))?;

        info!(%id, workdir = %dir.display(), "launched container");

        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.kills.insert(id.clone(), kill_tx);

        let sink = self.sink.clone();
        let kills = Arc::clone(&self.kills);
        let id = id.clone();
        tokio::spawn(async move {
            let completed = tokio::select! {
                status = child.wait() => {
                    let exit_status = match status {
                        Ok(status) => status.code().unwrap_or(exit_status::ABORTED),
                        Err(_) => exit_status::INVALID,
                    };
                    Completed { id: id.clone(), exit_status, diagnostics: String::new() }
                }
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Completed {
                        id: id.clone(),
                        exit_status: exit_status::KILLED_BY_APPMASTER,
                        diagnostics: "Stopped by application master".into(),
                    }
                }
            };
            kills.remove(&id);
            let _ = sink.send(ClusterEvent::ContainersCompleted(vec![completed]));
        });
        Ok(())
    }

    async fn stop_container(&self, id: &YarnContainerId) -> SkeinResult<()> {
        match self.kills.remove(id) {
            Some((_, kill)) => {
                let _ = kill.send(());
            }
            // Already finished or never launched; nothing to stop.
            None => debug!(%id, "stop requested for container with no running process"),
        }
        Ok(())
    }
}
