use std::process::Command;

/// Stdout of `git <args>`, or `None` outside a checkout.
fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn main() {
    let sha = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=CRONKEEPER_GIT_SHA={sha}");

    // `server.info` reports the build target next to the commit
    let target = std::env::var("TARGET").unwrap_or_default();
    println!("cargo:rustc-env=CRONKEEPER_BUILD_TARGET={target}");

    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs/");
}
