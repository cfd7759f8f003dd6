use std::{
    fs, io,
    net::SocketAddr,
    path::PathBuf,
};

use log::{error, info, warn};
use structopt::StructOpt;
use thiserror::Error;

use mcstat::{
    resolution::{parse_address, resolve_host_ips, resolve_minecraft_ips},
    timeout_from_secs, ModernPingData, ModernPinger, PingError, Pinger, QueryData, QueryPinger,
};

#[derive(StructOpt, Debug)]
#[structopt(name = "mcstat", about = "Ask a Minecraft server for its live status.")]
struct Opt {
    /// More log output; repeat for more detail. RUST_LOG overrides this.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Full-stat query over UDP (the server needs enable-query=true)
    Query(Target),
    /// Server list ping over TCP
    Ping {
        #[structopt(flatten)]
        target: Target,

        /// Write the server icon to this file
        #[structopt(long, parse(from_os_str))]
        favicon: Option<PathBuf>,

        /// Draw the server icon in the terminal
        #[structopt(long)]
        show_favicon: bool,
    },
}

#[derive(StructOpt, Debug)]
struct Target {
    /// host[:port]
    address: String,

    /// Overrides the port given in the address
    #[structopt(short, long)]
    port: Option<u16>,

    /// Seconds the whole exchange may take
    #[structopt(short, long, default_value = "2")]
    timeout: f64,

    /// Follow the _minecraft._tcp SRV record
    #[structopt(long)]
    srv: bool,

    /// Try every resolved address instead of only the first
    #[structopt(long)]
    all: bool,

    /// Print the result as JSON
    #[structopt(long)]
    json: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Ping(#[from] PingError),

    #[error("could not resolve address: {0}")]
    Resolve(#[source] io::Error),

    #[error("{0} did not resolve to any address")]
    NoAddress(String),

    #[error("could not write favicon: {0}")]
    FaviconWrite(#[source] io::Error),

    #[error("server sent an unreadable favicon")]
    FaviconData(#[from] base64::DecodeError),

    #[error("server sent an unreadable favicon")]
    FaviconImage(#[from] image::ImageError),

    #[error("could not draw favicon")]
    FaviconDraw(#[from] viuer::ViuError),

    #[error("JSON output failed")]
    Json(#[from] serde_json::Error),
}

fn main() {
    let opt = Opt::from_args();

    let default_filter = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(e) = run(opt.command) {
        error!("{}", e);
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            error!("  caused by: {}", cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Query(target) => {
            let pinger = QueryPinger {
                timeout: timeout_from_secs(target.timeout)?,
            };
            let (_, addrs) = resolve(&target)?;
            for_each_address(&addrs, |addr| {
                let data = pinger.ping(addr)?;
                if target.json {
                    print_json(&data)
                } else {
                    print_query(addr, &data);
                    Ok(())
                }
            })
        }
        Command::Ping {
            target,
            favicon,
            show_favicon,
        } => {
            let (host, addrs) = resolve(&target)?;
            let pinger = ModernPinger {
                hostname: host,
                timeout: timeout_from_secs(target.timeout)?,
            };
            for_each_address(&addrs, |addr| {
                let data = pinger.ping(addr)?;
                if target.json {
                    print_json(&data)?;
                } else {
                    print_ping(addr, &data);
                }
                handle_favicon(&data, favicon.as_ref(), show_favicon)
            })
        }
    }
}

fn resolve(target: &Target) -> Result<(String, Vec<SocketAddr>), CliError> {
    let (host, port) = parse_address(&target.address).map_err(CliError::Resolve)?;
    let port = target.port.unwrap_or(port);

    let resolved = if target.srv {
        resolve_minecraft_ips((host.clone(), port))
    } else {
        resolve_host_ips(&host, port)
    };
    let mut addrs: Vec<SocketAddr> = resolved.map_err(CliError::Resolve)?.into_iter().collect();
    addrs.sort();

    if addrs.is_empty() {
        return Err(CliError::NoAddress(host));
    }
    if !target.all {
        addrs.truncate(1);
    }
    info!("{} resolved to {:?}", host, addrs);
    Ok((host, addrs))
}

/// Every address gets its own call; the command fails only if all of them do.
fn for_each_address(
    addrs: &[SocketAddr],
    mut f: impl FnMut(SocketAddr) -> Result<(), CliError>,
) -> Result<(), CliError> {
    let mut last_error = None;
    let mut any_ok = false;
    for &addr in addrs {
        match f(addr) {
            Ok(()) => any_ok = true,
            Err(e) => {
                if addrs.len() > 1 {
                    warn!("{}: {}", addr, e);
                }
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) if !any_ok => Err(e),
        _ => Ok(()),
    }
}

fn print_json<T: serde::Serialize>(data: &T) -> Result<(), CliError> {
    let value = serde_json::to_value(data)?;
    println!("{}", colored_json::to_colored_json_auto(&value)?);
    Ok(())
}

fn or_dash(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}

fn print_query(addr: SocketAddr, data: &QueryData) {
    println!("{} answered in {:.1} ms", addr, data.latency_seconds() * 1000.0);
    println!("  motd:     {}", or_dash(&data.motd));
    println!("  version:  {}", or_dash(&data.version));
    println!("  game:     {} ({})", or_dash(&data.game_type), or_dash(&data.game_id));
    println!("  map:      {}", or_dash(&data.map));
    println!(
        "  host:     {}:{}",
        or_dash(&data.host_ip),
        data.host_port
    );
    if let Some(software) = &data.software {
        println!("  software: {}", software);
    }
    if !data.plugins.is_empty() {
        println!("  plugins:  {}", data.plugins.join(", "));
    }
    match &data.player_list {
        Some(players) => println!(
            "  players:  {}/{} ({})",
            data.num_players,
            data.max_players,
            players.join(", ")
        ),
        None => println!("  players:  {}/{}", data.num_players, data.max_players),
    }
}

fn print_ping(addr: SocketAddr, data: &ModernPingData) {
    let response = &data.response;
    println!("{} answered in {:.1} ms", addr, data.latency_seconds() * 1000.0);
    println!("  motd:     {}", response.description.text());
    println!(
        "  version:  {} (protocol {})",
        response.version.name, response.version.protocol
    );
    let sample = response
        .players
        .sample
        .as_ref()
        .map(|sample| {
            sample
                .iter()
                .map(|player| player.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|names| !names.is_empty());
    match sample {
        Some(names) => println!(
            "  players:  {}/{} ({})",
            response.players.online, response.players.max, names
        ),
        None => println!(
            "  players:  {}/{}",
            response.players.online, response.players.max
        ),
    }
    if let Some(mods) = &response.mods {
        println!("  mods:     {} ({} loaded)", mods.ty, mods.mod_list.len());
    }
}

fn handle_favicon(
    data: &ModernPingData,
    path: Option<&PathBuf>,
    show: bool,
) -> Result<(), CliError> {
    if path.is_none() && !show {
        return Ok(());
    }
    let png = match data.response.favicon_png() {
        Some(png) => png?,
        None => {
            warn!("server has no favicon");
            return Ok(());
        }
    };

    if let Some(path) = path {
        fs::write(path, &png).map_err(CliError::FaviconWrite)?;
        info!("favicon written to {}", path.display());
    }
    if show {
        let image = image::load_from_memory(&png)?;
        let config = viuer::Config {
            width: Some(32),
            absolute_offset: false,
            ..Default::default()
        };
        viuer::print(&image, &config)?;
    }
    Ok(())
}
