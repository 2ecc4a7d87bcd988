//! Command-line front end: builds an image from host files.
//!
//! Usage: `mkfs IMG [FILE...]`
//!
//! Each host FILE lands in the image root under its base name, mode
//! 0755, owned by root. An `/etc` tree with `passwd` and `group` seeds
//! and a world-writable `/tmp` are always included.

use std::process::exit;

use ox6_mkfs::ImageBuilder;

fn main() {
    let mut args = std::env::args().skip(1);
    let img_path = match args.next() {
        Some(p) => p,
        None => {
            eprintln!("Usage: mkfs IMG [FILE...]");
            exit(1);
        }
    };

    let mut builder = ImageBuilder::new()
        .dir("/etc", 0o755, 0, 0)
        .file("/etc/passwd", b"root:x:0:0:root:/:/bin/sh\n", 0o644, 0, 0)
        .file("/etc/group", b"root:x:0:root\n", 0o644, 0, 0)
        .dir("/tmp", 0o777, 0, 0)
        .dir("/bin", 0o755, 0, 0);

    for host_path in args {
        let data = match std::fs::read(&host_path) {
            Ok(d) => d,
            Err(e) => {
                eprintln!("mkfs: cannot read {host_path}: {e}");
                exit(1);
            }
        };
        let name = host_path
            .rsplit('/')
            .next()
            .unwrap()
            .trim_start_matches('_');
        builder = builder.file(&format!("/bin/{name}"), &data, 0o755, 0, 0);
    }

    let image = builder.build();
    if let Err(e) = std::fs::write(&img_path, image) {
        eprintln!("mkfs: cannot write {img_path}: {e}");
        exit(1);
    }
}
