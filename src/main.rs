use std::env::set_var;
use clap::{arg, ArgAction, command};
use anyhow::{anyhow, Result};
use disk_driver::cache::CacheDiskDriver;
use disk_driver::file::FileDiskDriver;
use disk_driver::DiskDriver;
use log::*;
use rand::{RngCore, SeedableRng};
use rbtrfs::utils::init_logs;
use rbtrfs::{desc, MountOptions, Vcb, WriteFlags};

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(
            arg!(-d --device <FILES> "Device image paths, comma separated")
                .required(true),
        )
        .arg(arg!(--size <BYTES> "Size for newly created device images")
            .default_value("268435456"))
        .arg(arg!(--format "Create a fresh volume on the devices").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--profile <PROFILE> "Data block-group profile (single/dup/raid0/raid1/raid10/raid5/raid6)")
            .default_value("single"))
        .arg(arg!(--compress "Enable zlib compression").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--cached "Route devices through the LRU block cache").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--smoke "Run a write/read smoke exercise").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`").action(ArgAction::SetTrue)
            .required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    init_logs();

    let size: u64 = matches.get_one::<String>("size").unwrap().parse()?;
    let paths: Vec<String> = matches
        .get_one::<String>("device")
        .unwrap()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if paths.is_empty() {
        return Err(anyhow!("no device paths given"));
    }

    let profile = matches.get_one::<String>("profile").unwrap();
    let profile_flags = desc::parse_profile(profile)
        .ok_or(anyhow!("unknown profile: {}", profile))?;

    let mut options = MountOptions::default();
    options.data_profile = profile_flags;
    if matches.get_flag("compress") {
        options.compress = true;
        options.compress_type = desc::CompressionType::Zlib;
    }

    let cached = matches.get_flag("cached");
    let mut drivers: Vec<Box<dyn DiskDriver>> = vec![];
    for path in paths.iter() {
        let mut driver = FileDiskDriver::new(size);
        driver.ddriver_open(path)?;
        info!("Device: {}", path);
        if cached {
            drivers.push(Box::new(CacheDiskDriver::new(driver, 4096)));
        } else {
            drivers.push(Box::new(driver));
        }
    }

    let vcb = if matches.get_flag("format") {
        warn!("Will format {} device(s)!", paths.len());
        Vcb::format(drivers, options)?
    } else {
        Vcb::open(drivers, options)?
    };

    info!("fs stats: {}", vcb.superblock.read().unwrap().to_string());

    if matches.get_flag("smoke") {
        smoke(&vcb)?;
    }

    if !vcb.options.no_barrier {
        vcb.flush_devices()?;
    }
    Ok(())
}

/// Exercise the write path: a handful of writes of different shapes, each
/// read back and compared.
fn smoke(vcb: &Vcb) -> Result<()> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
    let mut fcb = vcb.create_fcb(5, 0x100, 0);

    // inline, sector-aligned, unaligned overwrite, large
    let shapes: [(u64, usize); 4] = [(0, 16), (0, 0x20000), (0x1800, 0x3000), (0x40000, 0x80000)];
    for (offset, len) in shapes {
        let mut payload = vec![0 as u8; len];
        rng.fill_bytes(&mut payload);
        let n = vcb
            .write(&mut fcb, offset, &payload, WriteFlags::default())
            .map_err(|e| anyhow!("write failed: {}", e))?;
        info!("wrote {:#x} bytes at {:#x}", n, offset);

        let mut back = vec![0 as u8; len];
        vcb.read(&fcb, offset, &mut back)
            .map_err(|e| anyhow!("read failed: {}", e))?;
        if back != payload {
            return Err(anyhow!("smoke mismatch at {:#x}+{:#x}", offset, len));
        }
    }

    info!(
        "file size {:#x}, {} extents, {:#x} blocks",
        fcb.inode_item.st_size,
        fcb.live_extents().count(),
        fcb.inode_item.st_blocks
    );
    for c in vcb.chunks.read().unwrap().iter() {
        let inner = c.lock_inner();
        info!(
            "chunk {:#x}: {} size {:#x} used {:#x}",
            c.offset,
            desc::profile_name(c.chunk_item.chunk_type),
            c.chunk_item.size,
            inner.used
        );
    }
    info!("All Done.");
    Ok(())
}
