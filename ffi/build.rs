//! Generates `netkit.h` for C hosts into `OUT_DIR`.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src");

    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let out_dir = env::var("OUT_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(&crate_dir));

    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("NETKIT_H")
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(out_dir.join("netkit.h"));
        }
        Err(err) => println!("cargo:warning=could not generate netkit.h: {err}"),
    }
}
