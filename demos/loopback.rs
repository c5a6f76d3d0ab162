#![allow(unused_crate_dependencies)]
#![allow(clippy::print_stdout)]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use gattmux::config::Config;
use gattmux::event_loop::{Client, EventLoop, Subscription};
use gattmux::manager::Manager;
use gattmux::remote::{RemoteCharacteristic, RemoteDescriptor, RemoteService};
use gattmux::stack::loopback::Loopback;
use gattmux::table::{CharacteristicDesc, Handle, Perm, Prop, ServiceDesc};
use gattmux::target::{Request, TargetSpec};
use gattmux::*;

const BATTERY: Uuid = Uuid::from_u16(0x180F);
const LEVEL: Uuid = Uuid::from_u16(0x2A19);
const CCC: Uuid = Uuid::from_u16(0x2902);

#[derive(Clone, Debug, clap::Parser)]
struct Args {
    /// Address of the simulated remote device.
    #[arg(short, long, default_value = "C0:FF:EE:00:00:01")]
    device: Addr,

    /// Configuration file (defaults to the per-user configuration).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of independent observers of the remote battery level.
    #[arg(short, long, default_value_t = 2)]
    observers: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let cfg = match args.config {
        Some(ref path) => Config::load(path)?,
        None => Config::per_user("gattmux").unwrap_or_else(|e| {
            warn!("Using default configuration ({e})");
            Config::default()
        }),
    };
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let mut stack = Loopback::new(tx);
    stack.add_device(args.device, remote_battery());
    stack.set_value(args.device, handle(0x12), vec![50]);
    let (event_loop, client) = EventLoop::spawn(Manager::new(stack, cfg), rx);
    let r = serve(&args, client).await;
    event_loop.stop().await;
    r
}

fn handle(h: u16) -> Handle {
    Handle::new(h).unwrap()
}

fn remote_battery() -> Vec<RemoteService> {
    vec![RemoteService {
        uuid: BATTERY,
        handle: Handle::new(0x10),
        characteristics: vec![RemoteCharacteristic {
            uuid: LEVEL,
            handle: handle(0x12),
            props: Prop::READ | Prop::NOTIFY,
            descriptors: vec![RemoteDescriptor {
                uuid: CCC,
                handle: handle(0x13),
            }],
        }],
    }]
}

async fn serve(args: &Args, c: Client) -> Result<()> {
    let (srv, app) = c.open_server(Uuid::from_u16(0xFFF0)).await?;
    let local = ServiceDesc {
        uuid: Some(BATTERY),
        characteristics: vec![CharacteristicDesc {
            uuid: LEVEL,
            props: Prop::READ | Prop::NOTIFY,
            perms: Perm::READ | Perm::WRITE,
            value: vec![100],
            descriptors: vec![],
        }],
        ..ServiceDesc::default()
    };
    let id = c.add_service(srv, local).await?;
    info!("Started local battery service {id} ({app})");
    c.dump_table()?;

    let svcs = c.discover_services(args.device).await?;
    info!("{} has {} service(s)", args.device, svcs.len());
    let remote = Request::remote(args.device, TargetSpec::path(BATTERY, LEVEL));
    let mut subs = Vec::with_capacity(args.observers);
    for _ in 0..args.observers {
        subs.push(c.observe(remote.clone()).await?);
    }
    for sub in subs {
        tokio::spawn(print_changes(sub));
    }

    println!("Commands: read | set <level> | local <level> | dump | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let ln = tokio::select! {
            ln = lines.next_line() => match ln? {
                None => return Ok(()),
                Some(ln) => ln,
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        let mut tok = ln.split_ascii_whitespace();
        let Some(cmd) = tok.next() else { continue };
        let arg = tok.next().and_then(|v| v.parse::<u8>().ok());
        let r = match (cmd, arg) {
            ("read" | "r", _) => c.read(remote.clone()).await.map(|v| {
                println!("Remote level: {v:?}");
            }),
            ("set" | "s", Some(v)) => c.write(remote.clone(), vec![vec![v]]).await,
            ("local" | "l", Some(v)) => {
                let req = Request::local(TargetSpec::path(BATTERY, LEVEL));
                c.write(req, vec![vec![v]]).await
            }
            ("dump" | "d", _) => c.dump_table(),
            ("quit" | "q", _) => return Ok(()),
            _ => {
                println!("Unknown command: {ln}");
                continue;
            }
        };
        if let Err(e) = r {
            println!("Error: {e}");
        }
    }
}

async fn print_changes(mut sub: Subscription) {
    while let Some(v) = sub.next().await {
        println!(
            "[{}] {}/{} = {:?}",
            sub.id(),
            v.addr.map_or_else(|| "local".to_owned(), |a| a.to_string()),
            v.characteristic,
            v.value
        );
    }
}
