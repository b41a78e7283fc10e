fn main() {
    let bindings = bindgen::Builder::default()
        .header("wrapper.h")
        .constified_enum_module("*")
        .derive_debug(true)
        .derive_default(true)
        .derive_partialeq(true)
        .generate()
        .expect("Unable to generate perf_event_open bindings");

    let out_path = std::path::PathBuf::from(std::env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");

    println!("cargo:rerun-if-changed=wrapper.h");
}
