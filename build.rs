use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=kernels");
    println!("cargo:rerun-if-env-changed=QPU_ASSEMBLER");
    println!("cargo:rerun-if-env-changed=QPUFORGE_KERNEL_SRC");

    locate_kernel_images();
}

/// Export the path of every QPU kernel image as a compile-time env var
///
/// Kernel sources (`<stem>.py`, py-videocore) are assembled when
/// `QPU_ASSEMBLER` names an interpreter; otherwise prebuilt `<stem>.qhex`
/// images next to them are used as-is.
fn locate_kernel_images() {
    let src_dir = PathBuf::from(env::var("QPUFORGE_KERNEL_SRC").unwrap_or_else(|_| "kernels".to_string()));
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let assembler = env::var("QPU_ASSEMBLER").ok();

    // (file stem, env var name)
    let kernels = [
        ("sgemm", "QPUFORGE_SGEMM_QHEX"),
        ("sgemm_1th", "QPUFORGE_SGEMM_1TH_QHEX"),
        ("sgemm_tt", "QPUFORGE_SGEMM_TT_QHEX"),
        ("sgemm_tt_1th", "QPUFORGE_SGEMM_TT_1TH_QHEX"),
        ("scopy", "QPUFORGE_SCOPY_QHEX"),
        ("scopy_1th", "QPUFORGE_SCOPY_1TH_QHEX"),
        ("somatcopy", "QPUFORGE_SOMATCOPY_QHEX"),
        ("somatcopy_1th", "QPUFORGE_SOMATCOPY_1TH_QHEX"),
        ("sabs", "QPUFORGE_SABS_QHEX"),
        ("sabs_1th", "QPUFORGE_SABS_1TH_QHEX"),
    ];

    for (stem, env_name) in &kernels {
        let source = src_dir.join(format!("{}.py", stem));
        let prebuilt = src_dir.join(format!("{}.qhex", stem));

        let image = match (&assembler, source.exists()) {
            (Some(asm), true) => assemble(asm, &source, &out_dir.join(format!("{}.qhex", stem))),
            _ if prebuilt.exists() => Some(prebuilt),
            _ => {
                println!("cargo:warning=QPU kernel image not found: {}", stem);
                None
            }
        };

        if let Some(path) = image {
            let path = path.canonicalize().unwrap_or(path);
            println!("cargo:rustc-env={}={}", env_name, path.display());
        }
    }
}

fn assemble(assembler: &str, source: &Path, output: &Path) -> Option<PathBuf> {
    match Command::new(assembler).arg(source).output() {
        Ok(out) if out.status.success() => match fs::write(output, &out.stdout) {
            Ok(()) => Some(output.to_path_buf()),
            Err(e) => {
                println!("cargo:warning=Failed to write {}: {}", output.display(), e);
                None
            }
        },
        Ok(out) => {
            println!(
                "cargo:warning=Failed to assemble {}: exit code {:?}",
                source.display(),
                out.status.code()
            );
            None
        }
        Err(e) => {
            println!(
                "cargo:warning=Failed to execute {} for {}: {:?}",
                assembler,
                source.display(),
                e
            );
            None
        }
    }
}
