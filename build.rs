fn main() {
    // RELEASE_VERSION (set by CI) wins over the Cargo.toml version
    let version = std::env::var("RELEASE_VERSION")
        .or_else(|_| std::env::var("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| "0.0.0".to_string());

    let profile = std::env::var("PROFILE").unwrap_or_default();
    let full_version = if profile == "debug" && std::env::var("RELEASE_VERSION").is_err() {
        format!("{version}-dev")
    } else {
        version
    };

    println!("cargo:rustc-env=FATDRIVE_VERSION={full_version}");
    println!("cargo:rerun-if-env-changed=RELEASE_VERSION");
}
