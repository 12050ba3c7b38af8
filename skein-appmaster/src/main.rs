use clap::Parser;
use skein::cluster::{event_channel, ClusterInterface, LocalCluster};
use skein::report::FinalStatus;
use skein::{ApplicationId, ApplicationMaster, ApplicationSpec, Resources, SkeinResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Run a single application master standalone against the local-process
/// cluster backend.
#[derive(Parser)]
struct Opts {
    /// The application specification file (yaml or json)
    spec: PathBuf,
    /// Directory containers run under, defaults to the system temp directory
    #[clap(long)]
    workdir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> SkeinResult<()> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();

    let spec = ApplicationSpec::from_path(&opts.spec)?;
    let cluster_timestamp =
        SystemTime::now().duration_since(UNIX_EPOCH).expect("time went backwards").as_millis() as u64;
    let app_id = ApplicationId { cluster_timestamp, seq: 1 };
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
    let workdir = opts.workdir.unwrap_or_else(|| std::env::temp_dir().join("skein"));

    let (sink, events) = event_channel();
    let cluster = LocalCluster::new(
        app_id,
        sink,
        workdir.join(app_id.to_string()),
        Resources::new(65536, 64),
    )?;
    let am = ApplicationMaster::start(app_id, user, spec, cluster as Arc<dyn ClusterInterface>, events)
        .await?;
    println!("{}", am.app_id());
    println!("skein://{}", am.address());

    let (status, diagnostics) = am.wait_finished().await;
    if status != FinalStatus::Succeeded {
        eprintln!("application finished with status {}: {}", status, diagnostics);
        std::process::exit(1);
    }
    Ok(())
}
