use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Extra directory searched before every other location.
pub const ENV_LIB_DIR: &str = "FVCDENOISE_LIB_DIR";

/// What [`setup_runtime_libs`] found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibPlan {
    pub searched: Vec<PathBuf>,
    /// `libonnxruntime` found in the search dirs, if any.
    pub ort_dylib: Option<PathBuf>,
    /// GPU runtime libraries in load order.
    pub preload: Vec<PathBuf>,
}

/// Search directories for runtime libraries, in priority order:
///   1. `$FVCDENOISE_LIB_DIR`
///   2. `<exe_dir>/` (Windows only)
///   3. `<exe_dir>/lib/`
///   4. `<exe_dir>/../lib/`
///   5. `<cwd>/lib/`
///   6. `/usr/local/lib/`, `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = env::var_os(ENV_LIB_DIR) {
        dirs.push(PathBuf::from(dir));
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
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

/// Load tier for known GPU runtime libs, or `None` for anything that must not
/// be preloaded. ORT providers depend on symbols from `libonnxruntime`, which
/// the `ort` crate loads later, so they are excluded.
///
///   0: CUDA runtime (cudart, cublas, cublasLt, cufft, curand)
///   1: cuDNN
///   2: TensorRT (nvinfer, nvonnxparser)
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if name.starts_with("libcudart")
        || name.starts_with("libcublas")
        || name.starts_with("libcufft")
        || name.starts_with("libcurand")
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
    if name.starts_with("cudart64_") || name.starts_with("cublas64_") || name.starts_with("cublaslt64_") {
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

/// GPU libraries found in `dirs`, sorted CUDA -> cuDNN -> TensorRT. The first
/// directory containing a given file name wins.
fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

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

/// Load with RTLD_GLOBAL so later dlopen calls from ORT resolve against it.
/// glibc caches `LD_LIBRARY_PATH` at startup, so setting it from `main` has
/// no effect; absolute paths bypass that.
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

/// Configure `ORT_DYLIB_PATH` and preload GPU runtime libraries.
///
/// Call at the very start of `main()`, before any ORT or tracing init; log
/// the returned plan with [`log_runtime_lib_status`] once tracing is up.
pub fn setup_runtime_libs() -> RuntimeLibPlan {
    let dirs = candidate_lib_dirs();
    let ort_dylib = find_ort_dylib_in_dirs(&dirs);

    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = &ort_dylib {
            env::set_var("ORT_DYLIB_PATH", path);
        }
    }

    let mut preload = collect_preload_libs(&dirs);
    preload.retain(|path| unsafe { load_library(path) });

    RuntimeLibPlan {
        searched: dirs,
        ort_dylib,
        preload,
    }
}

pub fn log_runtime_lib_status(plan: &RuntimeLibPlan) {
    match env::var("ORT_DYLIB_PATH") {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("ORT_DYLIB_PATH set to {ort} but file not found"),
        Err(_) => warn!(
            searched = plan.searched.len(),
            "ORT_DYLIB_PATH not set; ORT will try default search paths"
        ),
    }
    if plan.preload.is_empty() {
        debug!("No GPU runtime libraries preloaded");
    }
    for lib in &plan.preload {
        debug!(lib = %lib.display(), "Preloaded GPU runtime library");
    }
}
