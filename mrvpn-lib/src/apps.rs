// the resolution helpers are exercised by the windows walkers and the tests
#![cfg_attr(not(windows), allow(dead_code))]

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

pub mod icon;
#[cfg(windows)]
mod registry;
#[cfg(windows)]
mod uwp;

/// One installed application as shown to the UI. `exe_name` is the
/// case-insensitive identity used for split-tunnel process rules.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub name: String,
    pub exe_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,
    pub is_uwp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Raw values of one registry uninstall entry.
#[derive(Clone, Debug, Default)]
pub(crate) struct UninstallEntry {
    pub display_name: String,
    pub install_location: Option<String>,
    pub display_icon: Option<String>,
    pub uninstall_string: Option<String>,
}

/// Enumerates installed applications with icons, de-duplicated and sorted.
#[cfg(windows)]
pub fn list() -> Vec<AppInfo> {
    let mut found = registry::discover();
    found.extend(uwp::discover());
    let mut apps = merge(found);
    for app in &mut apps {
        if let Some(path) = app.install_path.clone() {
            app.icon = icon::extract(Path::new(&path));
        }
    }
    apps
}

#[cfg(not(windows))]
pub fn list() -> Vec<AppInfo> {
    tracing::debug!("application enumeration is only available on windows");
    Vec::new()
}

/// Drops entries without an executable, de-duplicates case-insensitively on
/// `exe_name` (first wins) and sorts case-insensitively by display name.
fn merge(found: Vec<AppInfo>) -> Vec<AppInfo> {
    let mut seen = std::collections::HashSet::new();
    let mut apps: Vec<AppInfo> = found
        .into_iter()
        .filter(|app| !app.exe_name.trim().is_empty())
        .filter(|app| seen.insert(app.exe_name.to_lowercase()))
        .collect();
    apps.sort_by_key(|app| app.name.to_lowercase());
    apps
}

/// Resolves the executable an uninstall entry points at, first rule that
/// yields an existing file wins.
pub(crate) fn resolve_executable(entry: &UninstallEntry) -> Option<PathBuf> {
    if let Some(path) = display_icon_executable(entry.display_icon.as_deref()) {
        return Some(path);
    }

    if let Some(install) = entry.install_location.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        let install = Path::new(install);
        if let Some(path) = squirrel_executable(install, &entry.display_name) {
            return Some(path);
        }
        if let Some(path) = first_executable_in(install) {
            return Some(path);
        }
    }

    uninstall_string_executable(entry.uninstall_string.as_deref())
}

fn display_icon_executable(display_icon: Option<&str>) -> Option<PathBuf> {
    let raw = display_icon?;
    // "C:\path\app.exe,0" with optional quoting
    let cleaned = raw.split(',').next().unwrap_or(raw).trim().trim_matches('"').trim();
    if !has_exe_extension(cleaned) {
        return None;
    }
    let path = PathBuf::from(cleaned);
    let file_name = path.file_name()?.to_string_lossy().into_owned();
    if is_updater(&file_name) || !path.is_file() {
        return None;
    }
    Some(path)
}

/// Squirrel installs keep the real executable inside the highest
/// `app-<version>` directory beside an updater stub.
fn squirrel_executable(install: &Path, display_name: &str) -> Option<PathBuf> {
    let mut versions: Vec<PathBuf> = std::fs::read_dir(install)
        .ok()?
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("app-"))
        .map(|entry| entry.path())
        .collect();
    versions.sort();
    let latest = versions.pop()?;

    let executables = executables_in(&latest);
    let wanted = normalize(display_name);
    executables
        .iter()
        .find(|path| {
            let stem = path.file_stem().map(|s| normalize(&s.to_string_lossy())).unwrap_or_default();
            !stem.is_empty() && wanted.contains(&stem)
        })
        .or_else(|| executables.first())
        .cloned()
}

fn first_executable_in(dir: &Path) -> Option<PathBuf> {
    executables_in(dir).into_iter().next()
}

fn uninstall_string_executable(uninstall_string: Option<&str>) -> Option<PathBuf> {
    let token = first_token(uninstall_string?.trim())?;
    if !has_exe_extension(&token) {
        return None;
    }
    let path = PathBuf::from(token);
    let file_name = path.file_name()?.to_string_lossy().into_owned();
    if is_updater(&file_name) || !path.is_file() {
        return None;
    }
    Some(path)
}

// non-updater executables directly inside `dir`, name-sorted
fn executables_in(dir: &Path) -> Vec<PathBuf> {
    let mut executables: Vec<PathBuf> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_exe_extension(&path.to_string_lossy()))
        .filter(|path| {
            path.file_name()
                .map(|name| !is_updater(&name.to_string_lossy()))
                .unwrap_or(false)
        })
        .collect();
    executables.sort();
    executables
}

pub(crate) fn is_updater(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    matches!(lower.as_str(), "update.exe" | "unins000.exe" | "uninstall.exe")
        || lower.contains("updater")
        || lower.contains("uninstall")
        || lower.contains("helper")
}

fn has_exe_extension(path: &str) -> bool {
    path.to_lowercase().ends_with(".exe")
}

fn normalize(name: &str) -> String {
    name.to_lowercase().replace(' ', "")
}

fn first_token(command: &str) -> Option<String> {
    if let Some(rest) = command.strip_prefix('"') {
        return rest.split('"').next().map(str::to_string);
    }
    command.split_whitespace().next().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;

    fn touch(path: &Path) {
        fs::File::create(path).expect("create file");
    }

    fn app(name: &str, exe: &str) -> AppInfo {
        AppInfo {
            name: name.to_string(),
            exe_name: exe.to_string(),
            install_path: None,
            is_uwp: false,
            icon: None,
        }
    }

    #[rstest]
    #[case("Update.exe", true)]
    #[case("unins000.exe", true)]
    #[case("Uninstall.exe", true)]
    #[case("MyAppUpdater.exe", true)]
    #[case("crash-helper.exe", true)]
    #[case("chrome.exe", false)]
    #[case("code.exe", false)]
    fn flags_updater_executables(#[case] file_name: &str, #[case] expected: bool) {
        assert_eq!(is_updater(file_name), expected);
    }

    #[test]
    fn merge_deduplicates_case_insensitively_and_sorts() {
        let merged = merge(vec![
            app("zebra", "Zebra.exe"),
            app("Alpha", "alpha.exe"),
            app("zebra again", "ZEBRA.EXE"),
            app("ghost", ""),
        ]);

        let names: Vec<&str> = merged.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "zebra"]);
    }

    #[test]
    fn display_icon_path_wins_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("app.exe");
        touch(&exe);

        let entry = UninstallEntry {
            display_name: "App".to_string(),
            display_icon: Some(format!("\"{}\",0", exe.display())),
            ..UninstallEntry::default()
        };
        assert_eq!(resolve_executable(&entry), Some(exe));
    }

    #[test]
    fn updater_display_icon_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let updater = dir.path().join("Update.exe");
        let real = dir.path().join("realapp.exe");
        touch(&updater);
        touch(&real);

        let entry = UninstallEntry {
            display_name: "Real App".to_string(),
            display_icon: Some(updater.display().to_string()),
            install_location: Some(dir.path().display().to_string()),
            ..UninstallEntry::default()
        };
        assert_eq!(resolve_executable(&entry), Some(real));
    }

    #[test]
    fn squirrel_layout_picks_matching_exe_in_highest_version() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("app-1.0.3");
        let new = dir.path().join("app-1.2.0");
        fs::create_dir(&old).unwrap();
        fs::create_dir(&new).unwrap();
        touch(&old.join("Cool Tool.exe"));
        touch(&new.join("squirrel-helper.exe"));
        touch(&new.join("Cool Tool.exe"));
        touch(&dir.path().join("Update.exe"));

        let entry = UninstallEntry {
            display_name: "Cool Tool".to_string(),
            install_location: Some(dir.path().display().to_string()),
            ..UninstallEntry::default()
        };
        assert_eq!(resolve_executable(&entry), Some(new.join("Cool Tool.exe")));
    }

    #[test]
    fn squirrel_layout_falls_back_to_first_non_updater_exe() {
        let dir = tempfile::tempdir().unwrap();
        let versioned = dir.path().join("app-2.0.0");
        fs::create_dir(&versioned).unwrap();
        touch(&versioned.join("b-something.exe"));
        touch(&versioned.join("a-updater.exe"));

        let entry = UninstallEntry {
            display_name: "Entirely Different Name".to_string(),
            install_location: Some(dir.path().display().to_string()),
            ..UninstallEntry::default()
        };
        assert_eq!(resolve_executable(&entry), Some(versioned.join("b-something.exe")));
    }

    #[test]
    fn plain_install_location_yields_first_executable() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("tool.exe"));
        touch(&dir.path().join("uninstall.exe"));
        touch(&dir.path().join("readme.txt"));

        let entry = UninstallEntry {
            display_name: "Tool".to_string(),
            install_location: Some(dir.path().display().to_string()),
            ..UninstallEntry::default()
        };
        assert_eq!(resolve_executable(&entry), Some(dir.path().join("tool.exe")));
    }

    #[test]
    fn uninstall_string_is_the_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("setup.exe");
        touch(&exe);

        let entry = UninstallEntry {
            display_name: "Setup Only".to_string(),
            uninstall_string: Some(format!("\"{}\" /remove", exe.display())),
            ..UninstallEntry::default()
        };
        assert_eq!(resolve_executable(&entry), Some(exe));

        let nothing = UninstallEntry {
            display_name: "Nothing".to_string(),
            uninstall_string: Some("msiexec /x {GUID}".to_string()),
            ..UninstallEntry::default()
        };
        assert_eq!(resolve_executable(&nothing), None);
    }

    #[rstest]
    #[case("\"C:\\Program Files\\App\\app.exe\" /S", "C:\\Program Files\\App\\app.exe")]
    #[case("C:\\app\\setup.exe /quiet", "C:\\app\\setup.exe")]
    fn extracts_first_command_token(#[case] command: &str, #[case] expected: &str) {
        assert_eq!(first_token(command).as_deref(), Some(expected));
    }
}
