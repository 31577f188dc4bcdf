use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct VersionOutput {
    name: &'static str,
    version: &'static str,
    target: String,
    profile: &'static str,
    os: &'static str,
    arch: &'static str,
    features: Vec<&'static str>,
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.extended {
        println!("relaymq {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let out = VersionOutput {
        name: "relaymq",
        version: env!("CARGO_PKG_VERSION"),
        target: target_triple(),
        profile: option_env!("RELAYMQ_BUILD_PROFILE").unwrap_or("unknown"),
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        features: active_features(),
    };

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("name: {}", out.name);
            println!("version: {}", out.version);
            println!("target: {}", out.target);
            println!("profile: {}", out.profile);
            println!("platform: {}/{}", out.os, out.arch);
            println!("features: {}", out.features.join(", "));
        }
    }
    Ok(SUCCESS)
}

fn target_triple() -> String {
    match option_env!("RELAYMQ_BUILD_TARGET") {
        Some(target) => target.to_string(),
        None => format!("{}-unknown-{}", std::env::consts::ARCH, std::env::consts::OS),
    }
}

fn active_features() -> Vec<&'static str> {
    let mut features = vec!["cli"];
    if cfg!(feature = "broker") {
        features.push("broker");
    }
    if cfg!(feature = "async") {
        features.push("async");
    }
    features
}
