//! systemd unit files: parsing copied units and synthesizing new ones.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::detect::{unit_runtimes, AppCapability, Runtime};

/// What restore needs to know about a copied unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Unit name without `.service`
    pub name: String,
    /// Authoritative working directory, straight from `WorkingDirectory=`
    pub working_dir: Option<PathBuf>,
    pub user: Option<String>,
    pub exec_start: Option<String>,
    pub runtimes: BTreeSet<Runtime>,
}

impl ServiceDescriptor {
    pub fn parse(name: &str, content: &str) -> Self {
        let mut working_dir = None;
        let mut user = None;
        let mut exec_start = None;

        let mut in_service = false;
        for line in content.lines().map(str::trim) {
            if line.starts_with('[') {
                in_service = line == "[Service]";
                continue;
            }
            if !in_service || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                // a leading `-` only tells systemd to ignore a missing directory
                "WorkingDirectory" => {
                    working_dir = Some(PathBuf::from(value.trim_start_matches('-')))
                }
                "User" => user = Some(value.to_string()),
                "ExecStart" if exec_start.is_none() => exec_start = Some(value.to_string()),
                _ => {}
            }
        }

        Self {
            name: name.trim_end_matches(".service").to_string(),
            working_dir,
            user,
            exec_start,
            runtimes: unit_runtimes(content),
        }
    }

    pub fn unit_file_name(&self) -> String {
        format!("{}.service", self.name)
    }
}

/// A unit generated for an entry point that had none on the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedUnit {
    pub name: String,
    pub user: String,
    pub working_dir: PathBuf,
    pub exec_start: String,
    pub port: u16,
}

impl SynthesizedUnit {
    /// Build a unit for a detected app, or `None` when it has no entry point.
    pub fn for_app(app: &AppCapability, owner: &str, port: u16) -> Option<Self> {
        let entry = app.entry_point.as_deref()?;
        let exec_start = match app.runtime {
            Runtime::Node => format!("/usr/bin/node {}", entry),
            Runtime::Python => {
                // a requirements.txt without a venv gets `venv/` at install time
                let python = match (&app.venv, &app.manifest) {
                    (Some(venv), _) => app.dir.join(venv).join("bin/python").display().to_string(),
                    (None, Some(_)) => app.dir.join("venv/bin/python").display().to_string(),
                    (None, None) => "/usr/bin/python3".to_string(),
                };
                if entry == "manage.py" {
                    format!("{} manage.py runserver 0.0.0.0:{}", python, port)
                } else {
                    format!("{} {}", python, entry)
                }
            }
        };
        Some(Self {
            name: unit_name_for(owner, &app.dir),
            user: owner.to_string(),
            working_dir: app.dir.clone(),
            exec_start,
            port,
        })
    }

    pub fn unit_file_name(&self) -> String {
        format!("{}.service", self.name)
    }

    pub fn render(&self) -> String {
        format!(
            "[Unit]\n\
             Description={name}\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             User={user}\n\
             WorkingDirectory={dir}\n\
             Environment=PORT={port}\n\
             ExecStart={exec}\n\
             Restart=always\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            name = self.name,
            user = self.user,
            dir = self.working_dir.display(),
            port = self.port,
            exec = self.exec_start,
        )
    }
}

/// `alice` + `/home/alice/shop-api` → `alice-shop-api`
fn unit_name_for(owner: &str, dir: &Path) -> String {
    let base = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "app".to_string());
    let sanitized: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("{}-{}", owner, sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: &str = "[Unit]\n\
                        Description=Shop API\n\
                        WorkingDirectory=/wrong/section\n\
                        \n\
                        [Service]\n\
                        User=alice\n\
                        WorkingDirectory=-/opt/svc\n\
                        ExecStart=/opt/svc/run.sh --port 9000\n\
                        Restart=always\n\
                        \n\
                        [Install]\n\
                        WantedBy=multi-user.target\n";

    #[test]
    fn test_parse_service_section_only() {
        let unit = ServiceDescriptor::parse("svc.service", UNIT);
        assert_eq!(unit.name, "svc");
        assert_eq!(unit.working_dir, Some(PathBuf::from("/opt/svc")));
        assert_eq!(unit.user.as_deref(), Some("alice"));
        assert_eq!(unit.exec_start.as_deref(), Some("/opt/svc/run.sh --port 9000"));
        assert!(unit.runtimes.is_empty());
    }

    #[test]
    fn test_synthesize_django_unit() {
        let app = AppCapability {
            runtime: Runtime::Python,
            dir: PathBuf::from("/home/bob/blog"),
            manifest: Some(PathBuf::from("/home/bob/blog/requirements.txt")),
            entry_point: Some("manage.py".into()),
            default_port: 8000,
            venv: None,
        };
        let unit = SynthesizedUnit::for_app(&app, "bob", 8000).expect("entry point");
        let text = unit.render();

        assert_eq!(unit.unit_file_name(), "bob-blog.service");
        assert!(text.contains("User=bob\n"));
        assert!(text.contains("WorkingDirectory=/home/bob/blog\n"));
        assert!(text.contains(
            "ExecStart=/home/bob/blog/venv/bin/python manage.py runserver 0.0.0.0:8000\n"
        ));
        assert!(text.contains("Restart=always\n"));
    }

    #[test]
    fn test_synthesized_unit_uses_shipped_dot_venv() {
        let app = AppCapability {
            runtime: Runtime::Python,
            dir: PathBuf::from("/home/bob/tool"),
            manifest: Some(PathBuf::from("/home/bob/tool/requirements.txt")),
            entry_point: Some("main.py".into()),
            default_port: 8000,
            venv: Some(".venv".into()),
        };
        let unit = SynthesizedUnit::for_app(&app, "bob", 8000).expect("entry point");
        assert_eq!(unit.exec_start, "/home/bob/tool/.venv/bin/python main.py");

        let bare = AppCapability {
            manifest: None,
            venv: None,
            ..app
        };
        let unit = SynthesizedUnit::for_app(&bare, "bob", 8000).expect("entry point");
        assert_eq!(unit.exec_start, "/usr/bin/python3 main.py");
    }

    #[test]
    fn test_no_unit_without_entry_point() {
        let app = AppCapability {
            runtime: Runtime::Node,
            dir: PathBuf::from("/home/alice/lib"),
            manifest: Some(PathBuf::from("/home/alice/lib/package.json")),
            entry_point: None,
            default_port: 3000,
            venv: None,
        };
        assert!(SynthesizedUnit::for_app(&app, "alice", 3000).is_none());
    }

    #[test]
    fn test_unit_name_sanitized() {
        assert_eq!(unit_name_for("alice", Path::new("/home/alice/my app")), "alice-my-app");
    }
}
