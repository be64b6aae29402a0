fn main() {
    #[cfg(feature = "embed-ebpf")]
    build_knock_ebpf();
}

#[cfg(feature = "embed-ebpf")]
fn build_knock_ebpf() {
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("linux") {
        return;
    }

    let metadata = aya_build::cargo_metadata::MetadataCommand::new()
        .manifest_path("../knock-ebpf/Cargo.toml")
        .exec()
        .expect("failed to fetch cargo metadata for eBPF crate");

    let packages = metadata
        .packages
        .into_iter()
        .filter(|pkg| pkg.name == "knock-ebpf")
        .collect::<Vec<_>>();

    aya_build::build_ebpf(packages).expect("failed to build eBPF programs");

    println!("cargo:rerun-if-changed=../knock-ebpf/src");
    println!("cargo:rerun-if-changed=../knock-common/src");
}
