// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! apiary-peer: one migration peer.
//!
//! The peer either receives its VM over the wire (`--connect` to a
//! source) or materialises it from local device files, resumes it, and
//! then optionally waits on `--listen` for the next host to come take
//! it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use slog::{info, o, Drain, Logger};
use tokio::net::{TcpListener, TcpStream};

use apiary::agent::{AgentServer, GuestAgent};
use apiary::device::{DeviceGroup, DeviceSpec, ExposeMode};
use apiary::migrate::{
    migrate_from, migrate_from_local, migrate_to, MigrateFromOptions,
    MigrateHooks, MigrateToOptions, RescueConfig,
};
use apiary::vmm::{UdsVmm, VmmApi};

#[derive(Parser)]
#[clap(about, version)]
struct Args {
    /// Device config: JSON array of device records
    #[clap(long, value_name = "FILE")]
    devices: PathBuf,

    /// VM directory (device nodes, sockets); enables kernel NBD expose
    #[clap(long, value_name = "DIR")]
    vm_dir: Option<PathBuf>,

    /// First /dev/nbdN index to allocate from
    #[clap(long, default_value_t = 0)]
    nbd_base: u32,

    /// Receive the VM from this source peer before resuming
    #[clap(long, value_name = "ADDR")]
    connect: Option<SocketAddr>,

    /// After resuming, accept one outgoing migration on this address
    #[clap(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Hypervisor control socket (line-JSON RPC)
    #[clap(long, value_name = "SOCK")]
    control_sock: PathBuf,

    /// Guest agent socket backing the vsock channel
    #[clap(long, value_name = "SOCK")]
    agent_sock: PathBuf,

    /// Device name holding hypervisor state
    #[clap(long, default_value = "state")]
    state_name: String,

    /// Device name holding the guest memory image
    #[clap(long, default_value = "memory")]
    memory_name: String,

    /// Parallel block movers per device
    #[clap(long, default_value_t = 16)]
    concurrency: usize,

    /// Seconds to wait for the guest agent around suspend/resume
    #[clap(long, default_value_t = 10)]
    agent_timeout_secs: u64,
}

fn build_log() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

fn load_specs(path: &PathBuf) -> Result<Vec<DeviceSpec>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let specs: Vec<DeviceSpec> =
        serde_json::from_slice(&raw).context("parsing device config")?;
    if specs.is_empty() {
        bail!("device config is empty");
    }
    Ok(specs)
}

fn device_base(specs: &[DeviceSpec], name: &str) -> Result<PathBuf> {
    specs
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.base.clone())
        .with_context(|| format!("no device named {name} in config"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log = build_log();
    let specs = load_specs(&args.devices)?;

    let expose = match &args.vm_dir {
        Some(vm_dir) => {
            std::fs::create_dir_all(vm_dir)?;
            ExposeMode::Kernel {
                vm_dir: vm_dir.clone(),
                first_index: args.nbd_base,
            }
        }
        None => ExposeMode::None,
    };

    let state_base = device_base(&specs, &args.state_name)?;
    let memory_base = device_base(&specs, &args.memory_name)?;
    let agent_timeout = Duration::from_secs(args.agent_timeout_secs);

    let vmm: Arc<dyn VmmApi> =
        Arc::new(UdsVmm::new(&args.control_sock, log.clone()));

    // Phase 1: obtain the devices, over the wire or from disk.
    let group: Arc<DeviceGroup> = match args.connect {
        Some(addr) => {
            info!(log, "receiving migration"; "source" => %addr);
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("connecting to {addr}"))?;
            stream.set_nodelay(true)?;
            let incoming = migrate_from(
                specs.clone(),
                expose,
                stream,
                MigrateFromOptions::default(),
                &log,
            );
            incoming.wait().await.context("incoming migration failed")?
        }
        None => {
            info!(log, "materialising devices locally");
            migrate_from_local(specs.clone(), expose, &log)?
        }
    };

    // Phase 2: resume the guest and let the agent settle.
    info!(log, "resuming guest"; "state" => %state_base.display(),
        "memory" => %memory_base.display());
    vmm.resume_snapshot(&state_base, &memory_base)
        .await
        .context("resuming from snapshot")?;

    let agent_server =
        AgentServer::bind(&args.agent_sock).context("binding agent socket")?;
    let agent = Arc::new(
        agent_server
            .accept(agent_timeout, log.clone())
            .await
            .context("waiting for guest agent")?,
    );
    agent.after_resume(agent_timeout).await.context("agent AfterResume")?;
    info!(log, "guest is running");

    // Phase 3: optionally hand the VM to whoever asks for it.
    if let Some(addr) = args.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("listening on {addr}"))?;
        info!(log, "awaiting outgoing migration"; "addr" => %addr);
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(log, "destination connected"; "peer" => %peer);

        let opts = MigrateToOptions {
            concurrency: args.concurrency,
            suspend_timeout: agent_timeout,
            rescue: Some(RescueConfig {
                state_path: state_base.clone(),
                memory_path: memory_base.clone(),
            }),
            hooks: MigrateHooks {
                on_before_suspend: Some(Box::new({
                    let log = log.clone();
                    move || info!(log, "suspending guest for handoff")
                })),
                ..Default::default()
            },
            ..Default::default()
        };
        migrate_to(&group, Arc::clone(&vmm), agent, stream, opts, &log)
            .await
            .context("outgoing migration failed")?;
        info!(log, "guest handed off; shutting down");
    } else {
        // Park until interrupted; the guest runs on.
        tokio::signal::ctrl_c().await?;
        info!(log, "interrupted");
    }

    group.close().await;
    Ok(())
}
