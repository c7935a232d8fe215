use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=wrapper.h");
    println!("cargo:rustc-link-lib=fabric");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    // Most of the fi_* data-transfer calls are static inline dispatchers
    // through the fid ops tables, so bindgen has to emit extern wrappers.
    let extern_c = out_path.join("extern.c");

    let bindings = bindgen::Builder::default()
        .header("wrapper.h")
        .allowlist_function("fi_.*")
        .allowlist_type("fi_.*")
        .allowlist_type("fid_.*")
        .allowlist_var("FI_.*")
        .allowlist_var("fi_.*")
        .wrap_static_fns(true)
        .wrap_static_fns_path(&extern_c)
        .layout_tests(false)
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .generate()
        .expect("Unable to generate bindings");

    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");

    cc::Build::new()
        .file(&extern_c)
        .include(env::var("CARGO_MANIFEST_DIR").unwrap())
        .compile("fabric_extern");
}
