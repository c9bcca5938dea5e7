#[macro_use]
extern crate log;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod logging;

use crate::logging::setup_logging;
use clap::{Arg, ArgMatches, Command};
use snapup::{
    bootloader, client,
    config::DaemonConfig,
    daemon::Daemon,
    events::Reporter,
    protocol::{Request, UpdateRequest},
    session_log::SessionLog,
    sighandler, stage2,
};
use std::{path::Path, process::exit};

pub mod error {
    use snapup::{
        bootloader::BootloaderError, client::ClientError, daemon::DaemonError,
        upgrade::UpgradeError,
    };
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum Error {
        #[error("client error")]
        Client(#[from] ClientError),

        #[error("daemon initialization error")]
        Daemon(#[from] DaemonError),

        #[error("stage-2 finalization failed")]
        Stage2(#[source] UpgradeError),

        #[error("bootloader update failed")]
        Bootloader(#[from] BootloaderError),
    }
}

use self::error::Error;

#[tokio::main]
async fn main() {
    let _ = setup_logging(::log::LevelFilter::Debug);

    let matches = Command::new("snapup")
        .about("Transactional boot environment upgrade utility")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("addr")
                .long("addr")
                .help("address of the control socket")
                .takes_value(true)
                .global(true),
        )
        .subcommand(Command::new("daemon").about("launch the upgrade daemon and serve requests"))
        .subcommand(Command::new("check").about("check the system for pending updates"))
        .subcommand(
            Command::new("update")
                .about("stage an update into a new boot environment")
                .arg(
                    Arg::new("fullupdate")
                        .help("force a full reinstall of every package")
                        .short('f')
                        .long("fullupdate"),
                )
                .arg(
                    Arg::new("bename")
                        .help("name of the new boot environment; must not exist yet")
                        .long("bename")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("cachedir")
                        .help("where to download packages and keep session state")
                        .long("cachedir")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("updatefile")
                        .help("use the specified update image instead of fetching from remote")
                        .long("updatefile")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("updatekey")
                        .help("public key the offline update image is signed with")
                        .long("updatekey")
                        .takes_value(true),
                )
                .arg(
                    Arg::new("disable-bootstrap")
                        .help("skip the self-bootstrap even when this tool is part of the update")
                        .long("disable-bootstrap"),
                )
                .arg(
                    Arg::new("fetch-only")
                        .help("download pending packages without applying them")
                        .long("fetch-only"),
                ),
        )
        .subcommand(
            Command::new("stage2")
                .about("finalize a staged upgrade after reboot (run by the boot process)"),
        )
        .subcommand(
            Command::new("bootloader")
                .about("perform a one-time bootloader update from the running system"),
        )
        .get_matches();

    init();

    match main_(&matches).await {
        Ok(code) => exit(code),
        Err(why) => {
            eprintln!("snapup: {}", snapup::misc::format_error(&why));
            exit(1);
        }
    }
}

async fn main_(matches: &ArgMatches) -> Result<i32, Error> {
    match matches.subcommand() {
        Some(("daemon", matches)) => {
            Daemon::init(addr(matches)).await?;
            Ok(0)
        }
        Some(("check", matches)) => with_daemon(addr(matches), Request::Check).await,
        Some(("update", matches)) => {
            with_daemon(addr(matches), Request::Update(update_request(matches))).await
        }
        Some(("stage2", _)) => {
            let config = DaemonConfig::load();
            let reporter = Reporter::stdout(SessionLog::default());

            stage2::run(&config, &reporter).await.map_err(Error::Stage2)?;
            Ok(0)
        }
        Some(("bootloader", _)) => {
            let reporter = Reporter::stdout(SessionLog::default());

            bootloader::update(Path::new("/"), &reporter).await?;
            Ok(0)
        }
        _ => unreachable!("clap argument parsing failed"),
    }
}

/// Self-hosted one-shot session: a daemon task on a private address serves
/// exactly this invocation's request.
async fn with_daemon(addr: &str, request: Request) -> Result<i32, Error> {
    let bind = addr.to_owned();

    tokio::spawn(async move {
        if let Err(why) = Daemon::init(&bind).await {
            error!("daemon failed: {}", snapup::misc::format_error(&why));
        }
    });

    client::run(addr, &request).await.map_err(Error::from)
}

fn init() {
    sighandler::init();

    if !nix::unistd::geteuid().is_root() {
        eprintln!("snapup: must be run as root");
        exit(1);
    }
}

fn addr(matches: &ArgMatches) -> &str {
    matches.value_of("addr").unwrap_or(snapup::DEFAULT_ADDR)
}

fn update_request(matches: &ArgMatches) -> UpdateRequest {
    UpdateRequest {
        fullupdate: matches.is_present("fullupdate"),
        cachedir: matches.value_of("cachedir").unwrap_or_default().to_owned(),
        bename: matches.value_of("bename").unwrap_or_default().to_owned(),
        disablebs: matches.is_present("disable-bootstrap"),
        updatefile: matches.value_of("updatefile").unwrap_or_default().to_owned(),
        updatekey: matches.value_of("updatekey").unwrap_or_default().to_owned(),
        fetchonly: matches.is_present("fetch-only"),
    }
}
