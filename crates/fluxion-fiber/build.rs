use anyhow::{bail, Context};
use std::env;

fn main() -> anyhow::Result<()> {
    let target_os = env::var("CARGO_CFG_TARGET_OS").context("CARGO_CFG_TARGET_OS not set")?;
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH not set")?;

    if target_os == "windows" {
        // Windows uses the native Fiber API (CreateFiber/SwitchToFiber);
        // no assembly trampoline is needed there.
        return Ok(());
    }

    let asm_file = match target_arch.as_str() {
        "x86_64" => "src/arch/x86_64.s",
        "aarch64" => "src/arch/aarch64.s",
        other => bail!("fluxion-fiber has no context-switch assembly for target_arch `{other}`"),
    };

    println!("cargo:rerun-if-changed={asm_file}");
    cc::Build::new()
        .file(asm_file)
        .try_compile("fluxion_fiber_arch")
        .context("compiling the fiber context-switch assembly")?;
    Ok(())
}
