#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use apfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use apfs_btree::{omap_lookup, Table};
use apfs_core::{ApfsVolume, FsOps, MountOptions};
use apfs_ondisk::{
    nx_fs_oid, parse_apfs_superblock, parse_nx_superblock, parse_omap_phys, NX_FS_OID_OFFSET,
};
use apfs_types::{BlockSize, Oid, Paddr, NX_BLOCK_NUM, NX_DEFAULT_BLOCK_SIZE};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "apfs", about = "Read-only Apple File System toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect a container image: geometry and per-volume metadata.
    Inspect {
        /// Path to the block device or image.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Mount one volume read-only via FUSE (blocks until unmounted).
    Mount {
        /// Path to the block device or image.
        image: PathBuf,
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Mount options: comma-separated vol=<n>, uid=<n>, gid=<n>.
        #[arg(short = 'o', long, default_value = "")]
        options: String,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
    },
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    block_count: u64,
    uuid: String,
    max_file_systems: u32,
    volumes: Vec<VolumeOutput>,
}

#[derive(Debug, Serialize)]
struct VolumeOutput {
    index: u32,
    name: String,
    uuid: String,
    files: u64,
    directories: u64,
    symlinks: u64,
    other_objects: u64,
    alloc_count: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { image, json } => inspect(&image, json),
        Command::Mount {
            image,
            mountpoint,
            options,
            allow_other,
        } => mount_cmd(&image, &mountpoint, &options, allow_other),
    }
}

fn hex_uuid(uuid: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Open the container at its advertised block size, probing at the
/// default size first.
fn open_container(path: &PathBuf) -> Result<ByteBlockDevice<FileByteDevice>> {
    let dev = FileByteDevice::open(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?;
    let probe = BlockSize::new(NX_DEFAULT_BLOCK_SIZE).expect("default block size");
    let blocks = ByteBlockDevice::new(dev, probe).context("image is not block-aligned")?;
    let nx_buf = blocks.read_block(Paddr(NX_BLOCK_NUM))?;
    let nx = parse_nx_superblock(nx_buf.as_slice()).context("not an apfs container")?;
    if nx.block_size == probe {
        Ok(blocks)
    } else {
        Ok(blocks.with_block_size(nx.block_size)?)
    }
}

fn inspect(path: &PathBuf, json: bool) -> Result<()> {
    let blocks = open_container(path)?;
    let nx_buf = blocks.read_block(Paddr(NX_BLOCK_NUM))?;
    let nx_raw = nx_buf.as_slice();
    let nx = parse_nx_superblock(nx_raw).context("not an apfs container")?;

    let omap_buf = blocks.read_block(nx.omap_oid)?;
    let omap = parse_omap_phys(omap_buf.as_slice()).context("bad container omap descriptor")?;
    let omap_root = Table::open(&blocks, omap.tree_oid, None)?;

    let slots = (u64::from(nx.block_size.get()) - NX_FS_OID_OFFSET as u64) / 8;
    let mut volumes = Vec::new();
    for index in 0..u32::try_from(slots).unwrap_or(u32::MAX) {
        let oid = nx_fs_oid(nx_raw, index).context("container superblock truncated")?;
        if oid == Oid::INVALID {
            break;
        }
        let vsb = omap_lookup(&blocks, &omap_root, oid)
            .with_context(|| format!("volume {index} is missing from the container omap"))?;
        let buf = blocks.read_block(vsb)?;
        let sb = parse_apfs_superblock(buf.as_slice())
            .with_context(|| format!("bad volume superblock for volume {index}"))?;
        volumes.push(VolumeOutput {
            index,
            name: sb.volname.clone(),
            uuid: hex_uuid(&sb.vol_uuid),
            files: sb.num_files,
            directories: sb.num_directories,
            symlinks: sb.num_symlinks,
            other_objects: sb.num_other_fsobjects,
            alloc_count: sb.fs_alloc_count,
        });
    }

    let output = InspectOutput {
        block_size: nx.block_size.get(),
        block_count: nx.block_count,
        uuid: hex_uuid(&nx.uuid),
        max_file_systems: nx.max_file_systems,
        volumes,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("container: block_size={} blocks={}", output.block_size, output.block_count);
        println!("uuid: {}", output.uuid);
        for vol in &output.volumes {
            println!(
                "vol {}: {:?} files={} dirs={} symlinks={} other={} alloc={}",
                vol.index,
                vol.name,
                vol.files,
                vol.directories,
                vol.symlinks,
                vol.other_objects,
                vol.alloc_count
            );
        }
    }

    Ok(())
}

fn mount_cmd(image: &PathBuf, mountpoint: &PathBuf, options: &str, allow_other: bool) -> Result<()> {
    let opts = MountOptions::parse(options).context("bad mount options")?;
    let dev = FileByteDevice::open(image)
        .with_context(|| format!("failed to open image: {}", image.display()))?;
    let volume = ApfsVolume::mount(dev, opts)
        .with_context(|| format!("failed to mount {}", image.display()))?;

    eprintln!(
        "mounting volume {:?} ({} files) read-only at {}{}",
        volume.volume_sb().volname,
        volume.volume_sb().num_files,
        mountpoint.display(),
        volume.mount_options(),
    );

    let session = apfs_fuse::SessionOptions {
        allow_other,
        auto_unmount: true,
    };
    let ops: Box<dyn FsOps> = Box::new(volume);
    apfs_fuse::mount(ops, mountpoint, &session)
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;

    Ok(())
}
