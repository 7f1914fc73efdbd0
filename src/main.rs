use std::env::set_var;
use std::io::{self, BufRead, Write as _};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use clap::{arg, command, ArgAction, ArgMatches, Command};
use log::*;

use aefs::cipher::{find_cipher, Key};
use aefs::codec::{decrypt_sector_data, CryptoFlags, SectorData, SECTOR_SIZE};
use aefs::utils::init_logs;
use aefs::{
    create_volume, hash_phrase, query_dir_entries, query_file_info, query_id_from_path, read_file,
    read_superblock, CoreError, CryptedVolumeParms, SuperBlock,
};

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .subcommand_required(true)
        .arg(arg!(-k --key <PHRASE> "Passphrase; read from stdin when absent")
            .required(false)
            .global(true))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue)
            .global(true))
        .subcommand(
            Command::new("mkfs")
                .about("Create an empty volume in a directory")
                .arg(arg!(-c --cipher <SPEC> "Cipher (e.g. rijndael-128-128, twofish, none)")
                    .default_value("rijndael-128-128"))
                .arg(arg!(--"no-cbc" "Do not use CBC mode (only for debugging)")
                    .action(ArgAction::SetTrue))
                .arg(arg!(-l --label <LABEL> "Volume label").default_value("AEFS"))
                .arg(arg!(-d --description <TEXT> "Volume description").required(false))
                .arg(arg!(<dir> "Volume base directory")),
        )
        .subcommand(
            Command::new("info")
                .about("Print superblock fields and volume statistics")
                .arg(arg!(<dir> "Volume base directory")),
        )
        .subcommand(
            Command::new("ls")
                .about("List a directory inside the volume")
                .arg(arg!(-l --long "Show IDs, sizes and modes").action(ArgAction::SetTrue))
                .arg(arg!(<dir> "Volume base directory"))
                .arg(arg!([path] "Path inside the volume").default_value("/")),
        )
        .subcommand(
            Command::new("cat")
                .about("Write a file's contents to standard output")
                .arg(arg!(<dir> "Volume base directory"))
                .arg(arg!(<path> "Path inside the volume")),
        )
        .subcommand(
            Command::new("dump")
                .about("Decrypt a raw storage file to standard output")
                .arg(arg!(-c --cipher <SPEC> "Cipher used for the volume")
                    .default_value("rijndael-128-128"))
                .arg(arg!(--"no-cbc" "Do not use CBC mode").action(ArgAction::SetTrue))
                .arg(arg!(<file> "Storage file (<id>.enc)")),
        )
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    match matches.subcommand().unwrap() {
        ("mkfs", sub) => mkfs(sub),
        ("info", sub) => info(sub),
        ("ls", sub) => ls(sub),
        ("cat", sub) => cat(sub),
        ("dump", sub) => dump(sub),
        _ => unreachable!(),
    }
}

/// Get the passphrase from `-k` or by reading a line from stdin.
fn passphrase(matches: &ArgMatches) -> Result<String> {
    if let Some(phrase) = matches.get_one::<String>("key") {
        return Ok(phrase.clone());
    }
    eprint!("passphrase: ");
    io::stderr().flush()?;
    let mut phrase = String::new();
    io::stdin().lock().read_line(&mut phrase)?;
    Ok(phrase.trim_end_matches(['\r', '\n']).to_string())
}

fn relabel(e: CoreError) -> anyhow::Error {
    match e {
        CoreError::BadChecksum => anyhow!("bad checksum; probably an incorrect passphrase"),
        other => anyhow!(other),
    }
}

/// Open an existing volume, failing on any superblock problem.
fn open_volume(matches: &ArgMatches, dir: &str) -> Result<SuperBlock> {
    let phrase = passphrase(matches)?;
    let (sb, soft) = read_superblock(
        Path::new(dir),
        phrase.as_bytes(),
        CryptedVolumeParms {
            read_only: true,
            ..Default::default()
        },
    )
    .map_err(relabel)?;
    if let Some(e) = soft {
        return Err(relabel(e)).with_context(|| format!("unable to read the superblock of {}", dir));
    }
    Ok(sb)
}

fn mkfs(matches: &ArgMatches) -> Result<()> {
    let dir = matches.get_one::<String>("dir").unwrap();
    let phrase = passphrase(matches)?;
    let description = match matches.get_one::<String>("description") {
        Some(d) => d.clone(),
        None => "Volume created by aefs".to_string(),
    };

    let sb = create_volume(
        Path::new(dir),
        phrase.as_bytes(),
        matches.get_one::<String>("cipher").unwrap(),
        !matches.get_flag("no-cbc"),
        matches.get_one::<String>("label").unwrap(),
        &description,
        CryptedVolumeParms::default(),
    )
    .map_err(relabel)
    .with_context(|| format!("unable to create a volume in {}", dir))?;
    info!("created volume with root directory ID {}", sb.id_root);
    sb.drop_super_block().map_err(relabel)?;
    Ok(())
}

fn info(matches: &ArgMatches) -> Result<()> {
    let dir = matches.get_one::<String>("dir").unwrap();
    let sb = open_volume(matches, dir)?;

    println!("label:       {}", sb.label);
    println!("description: {}", sb.description);
    println!(
        "version:     {}.{}.{}",
        (sb.version >> 16) & 0xff,
        (sb.version >> 8) & 0xff,
        sb.version & 0xff
    );
    println!("root ID:     {:08x}", sb.id_root);
    println!("dirty:       {}", sb.flags & aefs::SBF_DIRTY != 0);
    let stats = sb.volume().stats();
    println!(
        "cache:       {} file(s), {} open, {} sector(s) cached, {} dirty",
        stats.c_crypted_files,
        stats.c_open_storage_files,
        stats.cs_in_cache,
        stats.cs_dirty
    );
    sb.drop_super_block().map_err(relabel)?;
    Ok(())
}

fn ls(matches: &ArgMatches) -> Result<()> {
    let dir = matches.get_one::<String>("dir").unwrap();
    let path = matches.get_one::<String>("path").unwrap();
    let long = matches.get_flag("long");

    let mut sb = open_volume(matches, dir)?;
    let root = sb.id_root;
    let vol = sb.volume_mut();

    let (id, _) = query_id_from_path(vol, root, path).map_err(relabel)?;
    for entry in query_dir_entries(vol, id).map_err(relabel)? {
        let name = String::from_utf8_lossy(&entry.name).into_owned();
        if long {
            let info = query_file_info(vol, entry.id).map_err(relabel)?;
            let kind = if info.is_dir() {
                'd'
            } else if info.is_symlink() {
                'l'
            } else {
                '-'
            };
            println!(
                "{:08x} {}{:03o} {:>10} {}",
                entry.id,
                kind,
                info.flags & 0o777,
                info.file_size,
                name
            );
        } else {
            println!("{}", name);
        }
    }

    sb.drop_super_block().map_err(relabel)?;
    Ok(())
}

fn cat(matches: &ArgMatches) -> Result<()> {
    let dir = matches.get_one::<String>("dir").unwrap();
    let path = matches.get_one::<String>("path").unwrap();

    let mut sb = open_volume(matches, dir)?;
    let root = sb.id_root;
    let vol = sb.volume_mut();

    let (id, _) = query_id_from_path(vol, root, path).map_err(relabel)?;
    let info = query_file_info(vol, id).map_err(relabel)?;
    if info.is_dir() {
        bail!("{} is a directory", path);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; 0x10000];
    let mut pos = 0;
    while pos < info.file_size {
        let read = read_file(vol, id, pos, &mut buf).map_err(relabel)?;
        if read == 0 {
            break;
        }
        out.write_all(&buf[..read])?;
        pos += read as u32;
    }

    sb.drop_super_block().map_err(relabel)?;
    Ok(())
}

fn dump(matches: &ArgMatches) -> Result<()> {
    let file = matches.get_one::<String>("file").unwrap();
    let spec = matches.get_one::<String>("cipher").unwrap();
    let flags = if matches.get_flag("no-cbc") {
        CryptoFlags::empty()
    } else {
        CryptoFlags::USE_CBC
    };

    let (cipher, cb_block, cb_key) = find_cipher(spec).map_err(|e| anyhow!(e))?;
    let phrase = passphrase(matches)?;
    let key_bytes = hash_phrase(phrase.as_bytes(), cb_key);
    let key = Key::new(cipher, cb_block, &key_bytes).map_err(|e| anyhow!(e))?;

    let data = std::fs::read(file).with_context(|| format!("unable to read {}", file))?;
    if data.len() % SECTOR_SIZE != 0 {
        warn!("{}: trailing data is not a whole sector", file);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut sector = SectorData::new();
    for (i, cipher_sector) in data.chunks_exact(SECTOR_SIZE).enumerate() {
        if decrypt_sector_data(cipher_sector, &mut sector, &key, flags).is_err() {
            eprintln!("{}: bad checksum in sector {}", file, i);
        }
        out.write_all(sector.payload())?;
    }

    Ok(())
}
