use chrono::NaiveDate;

/// Cloud folder for one server's backups on a given day.
pub fn cloud_folder_name(date: NaiveDate, server_name: &str) -> String {
    format!("{}-Database_{}", date.format("%Y_%m_%d"), server_name)
}

/// Makes a name safe for local paths, remote shell arguments and cloud object
/// names. Already-clean names come back unchanged.
pub fn normalize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;

    for c in name.trim().chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if last_was_sep {
                continue;
            }
            last_was_sep = true;
        } else {
            last_was_sep = false;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_start_matches(['.', '_']).trim_end_matches('_');
    if trimmed.is_empty() {
        "backup".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Last path component of a remote (unix) path.
pub fn remote_base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Parent directory of a remote (unix) path.
pub fn remote_parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        None => ".",
        Some(idx) => &trimmed[..idx],
    }
}

/// Single-quotes an argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}
