use std::env;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=GIT_DIR");
    println!("cargo:rerun-if-changed=.git/HEAD");

    let sha = git(&["rev-parse", "--short", "HEAD"]);
    match &sha {
        Ok(sha) => stamp("STARTER_GIT_SHA", sha),
        Err(err) => println!("cargo:warning=cannot determine git revision: {err}"),
    }

    let dirty = match git(&["status", "--porcelain"]) {
        Ok(output) if output.is_empty() => "clean",
        Ok(_) => "dirty",
        Err(_) => "unknown",
    };
    stamp("STARTER_GIT_DIRTY", dirty);

    stamp("STARTER_BUILD_TIMESTAMP", &Utc::now().to_rfc3339());
    stamp(
        "STARTER_BUILD_PROFILE",
        &env::var("PROFILE").unwrap_or_else(|_| "unknown".into()),
    );
}

fn stamp(key: &str, value: &str) {
    println!("cargo:rustc-env={key}={value}");
}

fn git(args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .map_err(|err| err.to_string())?;
    if !output.status.success() {
        return Err(format!("git {args:?} exited with {:?}", output.status.code()));
    }
    String::from_utf8(output.stdout)
        .map(|text| text.trim().to_string())
        .map_err(|err| err.to_string())
}
