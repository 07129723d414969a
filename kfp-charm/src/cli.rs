use std::path::Path;

use clap::Parser;

/// Kubeflow Pipelines API operator
///
/// Invoked once per hook, either through the dispatch script or as a
/// `hooks/<name>` symlink.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Hook being dispatched (e.g. "hooks/config-changed")
    #[arg(env = "JUJU_DISPATCH_PATH")]
    pub dispatch: Option<String>,
}

impl Args {
    /// Hook name from the dispatch path, falling back to the executable name
    pub fn hook_name(&self) -> Option<String> {
        match &self.dispatch {
            Some(dispatch) => file_name(dispatch),
            None => std::env::args().next().as_deref().and_then(file_name),
        }
    }
}

fn file_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_name_from_dispatch_path() {
        let args = Args::parse_from(["kfp-api-operator", "hooks/mysql-relation-changed"]);
        assert_eq!(args.hook_name().as_deref(), Some("mysql-relation-changed"));
    }

    #[test]
    fn test_file_name_of_bare_hook() {
        assert_eq!(file_name("install").as_deref(), Some("install"));
        assert_eq!(file_name("").as_deref(), None);
    }
}
