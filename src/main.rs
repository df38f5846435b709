use clap::{Arg, ArgAction, Command};
use exhume_hypervisor::{vbk::VBK, vma::VMA, Disk};
use std::io::{Read, Seek, SeekFrom};

fn dump_bytes(disk: &mut Disk, offset: u64, size: usize) {
    if let Err(e) = disk.seek(SeekFrom::Start(offset)) {
        eprintln!("Error seeking to offset {}: {}", offset, e);
        std::process::exit(1);
    }
    let mut bytes = vec![0u8; size];
    let read = match disk.read(&mut bytes) {
        Ok(read) => read,
        Err(e) => {
            eprintln!("Error reading {} bytes: {}", size, e);
            std::process::exit(1);
        }
    };
    let result = String::from_utf8_lossy(&bytes[..read]);
    println!("{}", result);
}

fn list_backup(file_path: &str) {
    // VBK and VMA are containers; list their contents instead of dumping.
    if let Ok(mut vbk) = VBK::open(std::path::Path::new(file_path)) {
        let mut pending = vec![(String::new(), vbk.root())];
        while let Some((prefix, item)) = pending.pop() {
            match vbk.iterdir(&item) {
                Ok(entries) => {
                    for entry in entries {
                        let path = format!("{}/{}", prefix, entry.name);
                        if entry.is_dir() {
                            pending.push((path, entry));
                        } else {
                            println!("{} ({} bytes)", path, entry.size);
                        }
                    }
                }
                Err(e) => eprintln!("Error listing {}: {}", prefix, e),
            }
        }
        return;
    }

    match VMA::open(std::path::Path::new(file_path)) {
        Ok(vma) => {
            for device in vma.devices() {
                println!("{} ({} bytes)", device.name, device.size);
            }
        }
        Err(e) => {
            eprintln!("Error: '{}' is not a VBK or VMA archive: {}", file_path, e);
            std::process::exit(1);
        }
    }
}

fn main() {
    env_logger::init();

    let matches = Command::new("exhume_hypervisor")
        .version("0.1.2")
        .author("ForensicXlab")
        .about("Read the virtual disks inside hypervisor disk images and backup containers.")
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_parser(clap::value_parser!(String))
                .required(true)
                .help("The path to the image file."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(clap::value_parser!(String))
                .help("The image format: qcow2, vhdx, vhd, vdi, vmdk, hdd, asif, raw or auto."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(clap::value_parser!(usize))
                .help("The size (in bytes) to read."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(clap::value_parser!(u64))
                .help("Read at a specific offset."),
        )
        .arg(
            Arg::new("list")
                .short('l')
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List the contents of a VBK or VMA backup container."),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let file_path = matches.get_one::<String>("input").unwrap();
    let format = matches
        .get_one::<String>("format")
        .map(String::as_str)
        .unwrap_or("auto");
    let size = *matches.get_one::<usize>("size").unwrap_or(&512);
    let offset = *matches.get_one::<u64>("offset").unwrap_or(&0);
    let verbose = matches.get_flag("verbose");

    if matches.get_flag("list") {
        list_backup(file_path);
        return;
    }

    let mut disk = match Disk::new(file_path.clone(), format) {
        Ok(disk) => disk,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if verbose {
        println!("------------------------------------------------------------");
        println!("Selected reader: {}", disk.format_description());
        println!("Disk size: {} bytes", disk.size());
        println!("------------------------------------------------------------");
        disk.print_info();
    }

    dump_bytes(&mut disk, offset, size);
}
