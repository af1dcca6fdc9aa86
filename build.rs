use std::env;
use std::process::Command;

fn main() {
    // This allows using #[cfg(sqlite)] instead of #[cfg(feature = "sqlite")], which helps when
    // trying to add them through macros.
    #[cfg(feature = "sqlite")]
    println!("cargo:rustc-cfg=sqlite");
    #[cfg(feature = "mysql")]
    println!("cargo:rustc-cfg=mysql");
    #[cfg(feature = "postgresql")]
    println!("cargo:rustc-cfg=postgresql");
    #[cfg(feature = "db2")]
    println!("cargo:rustc-cfg=db2");

    #[cfg(not(any(feature = "sqlite", feature = "mysql", feature = "postgresql", feature = "db2")))]
    compile_error!("You need to enable at least one engine feature, e.g. cargo build --features sqlite");

    let maybe_version = env::var("DBFLEET_VERSION").or_else(|_| version_from_git_info());
    if let Ok(version) = maybe_version {
        println!("cargo:rustc-env=DBFLEET_VERSION={}", version);
        println!("cargo:rustc-env=CARGO_PKG_VERSION={}", version);
    }
}

fn run(args: &[&str]) -> Result<String, std::io::Error> {
    let out = Command::new(args[0]).args(&args[1..]).output()?;
    if !out.status.success() {
        return Err(std::io::Error::other("command not successful"));
    }
    Ok(String::from_utf8(out.stdout).unwrap().trim().to_string())
}

/// Reads version info from Git (tags, branch, revision) for use via `env!("DBFLEET_VERSION")`.
fn version_from_git_info() -> Result<String, std::io::Error> {
    let exact_tag = run(&["git", "describe", "--abbrev=0", "--tags", "--exact-match"]).ok();
    if let Some(ref exact) = exact_tag {
        println!("cargo:rustc-env=GIT_EXACT_TAG={}", exact);
    }

    let last_tag = run(&["git", "describe", "--abbrev=0", "--tags"])?;
    println!("cargo:rustc-env=GIT_LAST_TAG={}", last_tag);

    let branch = run(&["git", "rev-parse", "--abbrev-ref", "HEAD"])?;
    println!("cargo:rustc-env=GIT_BRANCH={}", branch);

    let rev = run(&["git", "rev-parse", "HEAD"])?;
    let rev_short = rev.get(..8).unwrap_or_default();
    println!("cargo:rustc-env=GIT_REV={}", rev_short);

    if let Some(exact) = exact_tag {
        Ok(exact)
    } else if branch != "main" && branch != "master" {
        Ok(format!("{}-{} ({})", last_tag, rev_short, branch))
    } else {
        Ok(format!("{}-{}", last_tag, rev_short))
    }
}
