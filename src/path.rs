pub const ROOT: &str = "/";

pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        ROOT.to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

pub fn child(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Split into (parent, name). `None` for the root.
pub fn split(path: &str) -> Option<(&str, &str)> {
    if path == ROOT {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { ROOT } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// True when `path` equals `dir` or lies below it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == ROOT {
        return true;
    }
    path == dir
        || (path.starts_with(dir) && path.as_bytes().get(dir.len()) == Some(&b'/'))
}

/// Re-root `path` from under `from` to under `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        return to.to_string();
    }
    let rest = &path[from.len()..];
    if to == ROOT {
        rest.to_string()
    } else {
        format!("{}{}", to, rest)
    }
}
