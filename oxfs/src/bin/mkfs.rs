use std::{env, path::Path, process};

use oxfs::{fs::FileSystem, params};
use oxfs_types::BLOCK_SIZE;

fn main() {
    env_logger::init();

    let args = env::args().collect::<Vec<String>>();
    if args.len() < 2 || args.len() > 4 {
        eprintln!("Usage: {} IMAGE [SIZE_MIB [INODE_BITMAP_BLOCKS]]", args[0]);
        process::exit(1);
    }
    let image = Path::new(&args[1]);
    let size = args.get(2).map_or(params::DEFAULT_IMAGE_BYTES, |s| {
        let mib: u64 = s.parse().unwrap_or_else(|_| {
            eprintln!("bad size: {s}");
            process::exit(1);
        });
        mib << 20
    });
    let inode_bitmap_blocks = args.get(3).map_or(params::DEFAULT_INODE_BITMAP_BLOCKS, |s| {
        s.parse().unwrap_or_else(|_| {
            eprintln!("bad inode bitmap block count: {s}");
            process::exit(1);
        })
    });

    let total_blocks = (size / BLOCK_SIZE as u64) as u32;
    let fs = match FileSystem::create(image, size, total_blocks, inode_bitmap_blocks) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("mkfs: {}: {e}", image.display());
            process::exit(1);
        }
    };

    let sb = fs.super_block();
    println!(
        "{}: {} blocks of {} bytes ({} inodes, {} data blocks)",
        image.display(),
        sb.total_blocks,
        BLOCK_SIZE,
        sb.inode_area_blocks * oxfs_types::INODES_PER_BLOCK as u32,
        sb.data_area_blocks,
    );
}
