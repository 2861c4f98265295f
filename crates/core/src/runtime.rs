use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Directories searched for helper binaries before falling back to `PATH`:
/// the executable's own directory and its `bin/` siblings, then the working
/// directory and `<cwd>/bin`.
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(exe_dir) = env::current_exe()
        .and_then(|exe| exe.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
    {
        dirs.push(exe_dir.join("bin"));
        if let Some(parent) = exe_dir.parent() {
            dirs.push(parent.join("bin"));
        }
        dirs.insert(0, exe_dir);
    }

    if let Ok(cwd) = env::current_dir() {
        for dir in [cwd.join("bin"), cwd] {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
    }

    dirs
}

fn binary_file_names(binary: &str) -> Vec<String> {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        vec![format!("{binary}.exe"), binary.to_string()]
    } else {
        vec![binary.to_string()]
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = binary_file_names(binary);
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// A `Command` for a helper binary such as `ffprobe`, preferring a copy
/// shipped next to the executable.
pub fn command_for(binary: &str) -> Command {
    match find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        Some(path) => Command::new(path),
        None => Command::new(binary),
    }
}

/// Like [`command_for`], for a configured tool path. Bare names are looked
/// up; anything with a directory part is used as given.
pub fn command_for_path(tool: &Path) -> Command {
    let mut components = tool.components();
    match (components.next(), components.next(), tool.to_str()) {
        (Some(std::path::Component::Normal(_)), None, Some(name)) => command_for(name),
        _ => Command::new(tool),
    }
}
