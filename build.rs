//! Stamps the binaries with build time and git revision for `about` output
//! (`BUILD_TIMESTAMP`, `BUILD_GIT_SHA`).

use std::process::Command;

fn main() {
    let built_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    println!("cargo:rustc-env=BUILD_TIMESTAMP={built_at}");
    println!("cargo:rustc-env=BUILD_GIT_SHA={}", git_revision());

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}

/// Short commit hash, or "unknown" outside a checkout.
fn git_revision() -> String {
    let Ok(output) = Command::new("git").args(["rev-parse", "--short", "HEAD"]).output() else {
        return "unknown".into();
    };
    match String::from_utf8(output.stdout) {
        Ok(sha) if output.status.success() && !sha.trim().is_empty() => sha.trim().to_string(),
        _ => "unknown".into(),
    }
}
