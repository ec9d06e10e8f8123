//! ONNX Runtime and GPU library discovery.
//!
//! `ort` is built with `load-dynamic`, so `libonnxruntime` is opened at first
//! use from `ORT_DYLIB_PATH`. [`setup_runtime_libs`] must run at the very
//! start of `main()`, before any thread could read the environment.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// What [`setup_runtime_libs`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibReport {
    pub ort_dylib: Option<PathBuf>,
    pub ort_from_env: bool,
    pub preloaded: Vec<PathBuf>,
}

/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then the system lib
/// dirs on Unix. On Windows the executable's own directory comes first.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load tier for GPU runtime libraries: 0 CUDA, 1 cuDNN, 2 TensorRT.
/// ORT itself and its providers are never preloaded; they need symbols from
/// `libonnxruntime`, which `ort` opens later.
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["libcudart", "libcublaslt", "libcublas", "libcufft", "libcurand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["cudart64_", "cublas64_", "cublaslt64_"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries under `dirs` in load order (tier, then name). The first
/// directory holding a given file name wins.
fn collect_gpu_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// glibc caches `LD_LIBRARY_PATH` at startup, so libraries are opened by
/// absolute path with `RTLD_GLOBAL` instead.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point `ORT_DYLIB_PATH` at a bundled ONNX Runtime and preload GPU
/// libraries. Runs before tracing exists; pass the report to
/// [`log_runtime_lib_status`] afterwards.
pub fn setup_runtime_libs() -> RuntimeLibReport {
    let dirs = candidate_lib_dirs();
    let mut report = RuntimeLibReport::default();

    match env::var_os(ORT_DYLIB_ENV) {
        Some(existing) => {
            report.ort_from_env = true;
            report.ort_dylib = Some(PathBuf::from(existing));
        }
        None => {
            if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
                env::set_var(ORT_DYLIB_ENV, &path);
                report.ort_dylib = Some(path);
            }
        }
    }

    for lib in collect_gpu_libs(&dirs) {
        if unsafe { load_library(&lib) } {
            report.preloaded.push(lib);
        }
    }
    report
}

pub fn log_runtime_lib_status(report: &RuntimeLibReport) {
    match &report.ort_dylib {
        Some(path) if path.is_file() => {
            info!(path = %path.display(), from_env = report.ort_from_env, "ORT library");
        }
        Some(path) => warn!(path = %path.display(), "ORT_DYLIB_PATH points to a missing file"),
        None => warn!("ORT_DYLIB_PATH not set, ORT will try default search paths"),
    }
    for lib in &report.preloaded {
        debug!(path = %lib.display(), "Preloaded GPU library");
    }
}
