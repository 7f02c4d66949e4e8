use winreg::RegKey;
use winreg::enums::{HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_READ, KEY_WOW64_32KEY, KEY_WOW64_64KEY};

use crate::apps::{AppInfo, UninstallEntry, resolve_executable};

const UNINSTALL_PATH: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";

/// Walks the four uninstall hives (HKLM/HKCU, native and WOW6432) and
/// resolves each entry to an executable. Unreadable keys are skipped.
pub fn discover() -> Vec<AppInfo> {
    let mut apps = Vec::new();
    let hives = [
        (HKEY_LOCAL_MACHINE, KEY_WOW64_64KEY),
        (HKEY_LOCAL_MACHINE, KEY_WOW64_32KEY),
        (HKEY_CURRENT_USER, KEY_WOW64_64KEY),
        (HKEY_CURRENT_USER, KEY_WOW64_32KEY),
    ];

    for (hive, view) in hives {
        let root = RegKey::predef(hive);
        let uninstall = match root.open_subkey_with_flags(UNINSTALL_PATH, KEY_READ | view) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(error = %e, "uninstall hive not readable");
                continue;
            }
        };

        for name in uninstall.enum_keys().flatten() {
            let Ok(item) = uninstall.open_subkey_with_flags(&name, KEY_READ | view) else {
                continue;
            };
            let Ok(display_name) = item.get_value::<String, _>("DisplayName") else {
                continue;
            };
            let display_name = display_name.trim().to_string();
            if display_name.is_empty() {
                continue;
            }

            let entry = UninstallEntry {
                display_name: display_name.clone(),
                install_location: item.get_value("InstallLocation").ok(),
                display_icon: item.get_value("DisplayIcon").ok(),
                uninstall_string: item.get_value("UninstallString").ok(),
            };
            let Some(executable) = resolve_executable(&entry) else {
                continue;
            };
            let exe_name = executable
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            apps.push(AppInfo {
                name: display_name,
                exe_name,
                install_path: Some(executable.display().to_string()),
                is_uwp: false,
                icon: None,
            });
        }
    }

    apps
}
