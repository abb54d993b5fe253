//! `rcutil` - router contact and key file tool.
//!
//! Generates, updates, inspects, and verifies signed router contact files,
//! and pokes around a nodedb directory. Exit code 0 on success, 1 on any
//! failure, so test drivers can script it.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use mixroute::identity::{now_ms, Keypair, RouterId};
use mixroute::nodedb::{inline_disk, NodeDb, NodeRole};
use mixroute::contact::{AddressInfo, RouterContact};

#[derive(Parser, Debug)]
#[command(name = "rcutil")]
#[command(author, version, about = "router contact and key utility", long_about = None)]
struct Args {
    /// Generate a fresh keypair and signed contact file.
    #[arg(long, value_name = "FILE")]
    generate: Option<PathBuf>,

    /// Re-sign an existing contact file with a bumped timestamp.
    #[arg(long, value_name = "FILE")]
    update: Option<PathBuf>,

    /// Verify the signature of a contact file.
    #[arg(long, value_name = "FILE")]
    verify: Option<PathBuf>,

    /// Print the contents of a contact file.
    #[arg(long, value_name = "FILE")]
    read: Option<PathBuf>,

    /// List the contacts in a nodedb directory.
    #[arg(long, value_name = "DIR")]
    list: Option<PathBuf>,

    /// Import a contact file into the nodedb given by --list.
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,

    /// Export a contact from the local nodedb by hex public key.
    #[arg(long, value_name = "HEX")]
    export: Option<String>,

    /// Locate a contact by hex public key in the local nodedb.
    #[arg(long, value_name = "HEX")]
    locate: Option<String>,

    /// Print the local node's identity.
    #[arg(long = "localInfo", default_value_t = false)]
    local_info: bool,

    /// Node root directory for --export/--locate/--localInfo.
    #[arg(long, value_name = "PATH", default_value = ".")]
    config: PathBuf,

    /// Log level: debug, info, warn, or error.
    #[arg(long = "logLevel", value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    fmt().with_env_filter(filter).with_target(false).init();

    if let Err(err) = run(args) {
        eprintln!("rcutil: {:#}", err);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if let Some(file) = &args.generate {
        return generate(file);
    }
    if let Some(file) = &args.update {
        return update(file);
    }
    if let Some(file) = &args.verify {
        return verify(file);
    }
    if let Some(file) = &args.read {
        return read(file);
    }
    if let Some(file) = &args.import {
        let dir = args
            .list
            .as_ref()
            .context("--import needs --list <nodedb-dir>")?;
        return import(file, dir);
    }
    if let Some(dir) = &args.list {
        return list(dir);
    }
    if let Some(hex) = &args.export {
        return export(hex, &args.config);
    }
    if let Some(hex) = &args.locate {
        return locate(hex, &args.config);
    }
    if args.local_info {
        return local_info(&args.config);
    }
    bail!("nothing to do; see --help for commands");
}

/// Key file sitting next to a contact file.
fn key_path(file: &Path) -> PathBuf {
    let mut os = file.as_os_str().to_os_string();
    os.push(".key");
    PathBuf::from(os)
}

fn load_contact(file: &Path) -> Result<RouterContact> {
    let data =
        std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    RouterContact::decode(&data).map_err(|err| anyhow::anyhow!("{}: {}", file.display(), err))
}

fn generate(file: &Path) -> Result<()> {
    let keypair = Keypair::generate();
    let rc = RouterContact::new_signed(
        &keypair,
        vec![AddressInfo::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 1090)],
        vec![],
        None,
        now_ms(),
    );
    std::fs::write(file, rc.encode())
        .with_context(|| format!("writing {}", file.display()))?;

    let mut secret = Vec::with_capacity(64);
    secret.extend_from_slice(&keypair.signing_key().to_bytes());
    secret.extend_from_slice(keypair.router_id().as_bytes());
    std::fs::write(key_path(file), &secret)
        .with_context(|| format!("writing {}", key_path(file).display()))?;

    info!(id = %keypair.router_id(), file = %file.display(), "generated contact");
    Ok(())
}

fn update(file: &Path) -> Result<()> {
    let mut rc = load_contact(file)?;

    let key_file = key_path(file);
    let key_data = std::fs::read(&key_file)
        .with_context(|| format!("reading {}", key_file.display()))?;
    let seed = mixroute::identity::parse_key_file(&key_data)?;
    // the contact's encryption half is regenerated alongside; reuse what
    // the record carries so only the timestamp and signature change
    let keypair = Keypair::from_seeds(&seed, &seed);
    if keypair.router_id() != rc.router_id {
        bail!("key file does not match contact identity");
    }

    let bumped = now_ms().max(rc.last_updated + 1);
    rc.last_updated = bumped;
    rc.sign(&keypair);
    std::fs::write(file, rc.encode())
        .with_context(|| format!("writing {}", file.display()))?;
    info!(file = %file.display(), last_updated = bumped, "contact updated");
    Ok(())
}

fn verify(file: &Path) -> Result<()> {
    let rc = load_contact(file)?;
    rc.verify()
        .map_err(|err| anyhow::anyhow!("{}: {}", file.display(), err))?;
    println!("{}  OK", rc.router_id);
    Ok(())
}

fn read(file: &Path) -> Result<()> {
    let rc = load_contact(file)?;
    print_contact(&rc);
    Ok(())
}

fn print_contact(rc: &RouterContact) {
    println!("identity:    {}", rc.router_id);
    println!("encryption:  {}", hex::encode(rc.encryption));
    println!("updated:     {} ms", rc.last_updated);
    if let Some(nick) = &rc.nickname {
        println!("nickname:    {}", nick);
    }
    for addr in &rc.addrs {
        println!("address:     {}:{}", addr.ip, addr.port);
    }
    for exit in &rc.exits {
        println!("exit:        {}", exit.range);
    }
    println!(
        "signature:   {} ({})",
        hex::encode(&rc.signature[..8.min(rc.signature.len())]),
        if rc.verify().is_ok() { "valid" } else { "INVALID" }
    );
}

fn open_nodedb(dir: &Path) -> Result<NodeDb> {
    let mut db = NodeDb::new(Some(dir.to_path_buf()), NodeRole::Client, inline_disk());
    db.load_from_disk()?;
    Ok(db)
}

fn list(dir: &Path) -> Result<()> {
    let db = open_nodedb(dir)?;
    let mut ids: Vec<RouterId> = db.rcs().map(|rc| rc.router_id).collect();
    ids.sort();
    for (index, id) in ids.iter().enumerate() {
        println!("[{}]=>[{}]", index, id);
    }
    println!("{} contacts", ids.len());
    Ok(())
}

fn import(file: &Path, dir: &Path) -> Result<()> {
    let rc = load_contact(file)?;
    rc.verify()
        .map_err(|err| anyhow::anyhow!("refusing to import: {}", err))?;
    let mut db = open_nodedb(dir)?;
    if !db.put_rc_if_newer(rc.clone(), now_ms()) {
        bail!("nodedb already holds a newer contact for {}", rc.router_id);
    }
    db.save_to_disk();
    info!(id = %rc.router_id, "imported contact");
    Ok(())
}

fn export(hex_key: &str, root: &Path) -> Result<()> {
    let id = RouterId::from_hex(hex_key).context("bad hex public key")?;
    let db = open_nodedb(root)?;
    let rc = db
        .get_rc(&id)
        .with_context(|| format!("no contact for {}", id))?;
    let out = PathBuf::from(format!("{}.signed", id));
    std::fs::write(&out, rc.encode())
        .with_context(|| format!("writing {}", out.display()))?;
    println!("exported to {}", out.display());
    Ok(())
}

fn locate(hex_key: &str, root: &Path) -> Result<()> {
    let id = RouterId::from_hex(hex_key).context("bad hex public key")?;
    let db = open_nodedb(root)?;
    match db.get_rc(&id) {
        Some(rc) => {
            print_contact(rc);
            Ok(())
        }
        None => bail!("{} not found", id),
    }
}

fn local_info(root: &Path) -> Result<()> {
    let keypair = Keypair::load_or_generate(root)?;
    println!("identity:   {}", keypair.router_id());
    println!("encryption: {}", hex::encode(keypair.encryption_public()));
    Ok(())
}
