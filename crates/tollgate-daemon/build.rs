use std::process::Command;

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn main() {
    // release tarballs build outside a git checkout
    let version = git_describe().unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    println!("cargo:rustc-env=GIT_VERSION={version}");

    println!("cargo::rustc-check-cfg=cfg(distribute)");
    if std::env::var("PROFILE").as_deref() == Ok("distribute") {
        println!("cargo:rustc-cfg=distribute");
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
}
