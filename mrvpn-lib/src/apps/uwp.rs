use regex::Regex;
use windows::ApplicationModel::PackageSignatureKind;
use windows::Management::Deployment::PackageManager;
use windows::core::HSTRING;

use std::path::Path;

use crate::apps::AppInfo;

/// Enumerates store-signed, non-framework UWP packages. The executable entry
/// point comes from the package's AppX manifest.
pub fn discover() -> Vec<AppInfo> {
    match packages() {
        Ok(apps) => apps,
        Err(e) => {
            tracing::warn!(error = %e, "uwp package enumeration failed");
            Vec::new()
        }
    }
}

fn packages() -> windows::core::Result<Vec<AppInfo>> {
    let manager = PackageManager::new()?;
    let found = manager.FindPackagesByUserSecurityId(&HSTRING::new())?;
    let executable_attr = Regex::new(r#"Executable="([^"]+)""#).expect("static pattern");

    let mut apps = Vec::new();
    for package in found {
        if package.IsFramework().unwrap_or(true) {
            continue;
        }
        if package.SignatureKind()? != PackageSignatureKind::Store {
            continue;
        }
        let name = match package.DisplayName() {
            Ok(name) => name.to_string(),
            Err(_) => continue,
        };
        // unresolved resource references are useless as display names
        if name.is_empty() || name.starts_with("ms-resource") {
            continue;
        }

        let location = match package.InstalledLocation().and_then(|folder| folder.Path()) {
            Ok(path) => path.to_string(),
            Err(_) => continue,
        };
        let Ok(manifest) = std::fs::read_to_string(Path::new(&location).join("AppxManifest.xml")) else {
            continue;
        };
        let Some(captures) = executable_attr.captures(&manifest) else {
            continue;
        };
        let executable = Path::new(&location).join(&captures[1]);
        let exe_name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        apps.push(AppInfo {
            name,
            exe_name,
            install_path: Some(executable.display().to_string()),
            is_uwp: true,
            icon: None,
        });
    }
    Ok(apps)
}
