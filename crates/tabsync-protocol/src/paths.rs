//! Per-user locations of the session server socket and client files.
//!
//! XDG variables win when set to an absolute path; anything else falls back
//! to the usual `$HOME` locations, and finally to `/tmp`.

use std::path::{Path, PathBuf};

const APP: &str = "tabsync";

fn xdg_base(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    home_relative: &str,
) -> Option<PathBuf> {
    let usable = |value: String| {
        let path = PathBuf::from(value);
        path.is_absolute().then_some(path)
    };
    lookup(var)
        .and_then(usable)
        .or_else(|| lookup("HOME").and_then(usable).map(|home| home.join(home_relative)))
}

fn socket_path_with(lookup: impl Fn(&str) -> Option<String>, uid: u32) -> PathBuf {
    match lookup("XDG_RUNTIME_DIR").map(PathBuf::from) {
        Some(dir) if dir.is_absolute() => dir.join(format!("{APP}.sock")),
        _ => Path::new("/tmp").join(format!("{APP}-{uid}.sock")),
    }
}

fn env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

fn current_uid() -> u32 {
    // SAFETY: getuid() cannot fail and touches no memory we own
    unsafe { libc::getuid() }
}

/// Session server socket: `$XDG_RUNTIME_DIR/tabsync.sock`, or a per-uid
/// file in `/tmp` when there is no runtime dir.
pub fn default_socket_path() -> PathBuf {
    socket_path_with(env, current_uid())
}

pub fn config_dir() -> PathBuf {
    xdg_base(&env, "XDG_CONFIG_HOME", ".config")
        .map_or_else(|| PathBuf::from("/tmp").join(APP), |base| base.join(APP))
}

/// Where persisted scrollback lives.
pub fn data_dir() -> PathBuf {
    xdg_base(&env, "XDG_DATA_HOME", ".local/share")
        .map_or_else(|| PathBuf::from("/tmp").join(APP).join("data"), |base| base.join(APP))
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| map.get(var).cloned()
    }

    #[test]
    fn socket_prefers_runtime_dir() {
        let lookup = vars(&[("XDG_RUNTIME_DIR", "/run/user/1000")]);
        assert_eq!(
            socket_path_with(lookup, 1000),
            PathBuf::from("/run/user/1000/tabsync.sock")
        );
    }

    #[test]
    fn socket_falls_back_to_per_uid_tmp_file() {
        assert_eq!(
            socket_path_with(vars(&[]), 501),
            PathBuf::from("/tmp/tabsync-501.sock")
        );
        assert_eq!(
            socket_path_with(vars(&[("XDG_RUNTIME_DIR", "relative")]), 501),
            PathBuf::from("/tmp/tabsync-501.sock")
        );
    }

    #[test]
    fn xdg_base_ignores_relative_values() {
        let lookup = vars(&[("XDG_DATA_HOME", "data"), ("HOME", "/home/ada")]);
        assert_eq!(
            xdg_base(&lookup, "XDG_DATA_HOME", ".local/share"),
            Some(PathBuf::from("/home/ada/.local/share"))
        );
        assert_eq!(xdg_base(&vars(&[]), "XDG_DATA_HOME", ".local/share"), None);
    }
}
