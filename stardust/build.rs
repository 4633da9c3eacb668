use std::{
    env,
    fs::File,
    io::{Result, Write},
    path::PathBuf,
};

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=bootstrap.S");
    println!("cargo:rerun-if-changed=link.x");

    // host builds (`cargo doc`, IDEs) have nothing to link
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
        return Ok(());
    }

    // write out linker script so can be found by linker
    let out = &PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo"));
    File::create(out.join("link.x"))?.write_all(include_bytes!("link.x"))?;
    println!("cargo:rustc-link-search={}", out.display());
    println!("cargo:rustc-link-arg-bins=-Tlink.x");

    // build boot entry and Xen ELF notes
    cc::Build::new()
        .file("bootstrap.S")
        .flag("-D__ASSEMBLY__")
        .flag("-m64")
        .compile("bootstrap");

    Ok(())
}
