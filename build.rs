use miette::{miette, IntoDiagnostic};

fn build_constants() -> miette::Result<()> {
    let out_dir: std::path::PathBuf = std::env::var("OUT_DIR").into_diagnostic()?.into();
    let mut code = Vec::new();
    println!("cargo:rerun-if-env-changed=K");

    let k: u32 = std::env::var("K")
        .unwrap_or_else(|_| "21".into())
        .parse()
        .map_err(|e| miette!("K is not a number: {e}"))?;
    if !(1..=32).contains(&k) {
        return Err(miette!("K must be in 1..=32, got {k}"));
    }
    code.push("/// Mer size used when none is given on the command line.".to_string());
    code.push(format!("pub const DEFAULT_MER_SIZE: u32 = {k};"));

    std::fs::write(out_dir.join("constants.rs"), code.join("\n")).into_diagnostic()?;
    Ok(())
}

fn main() -> miette::Result<()> {
    println!("cargo:rerun-if-changed=build.rs");
    build_constants()
}
