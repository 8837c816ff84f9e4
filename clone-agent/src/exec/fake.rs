//! Recording command runner for tests.

use std::cell::RefCell;
use std::collections::BTreeSet;

use super::{CommandOutput, CommandRunner, CommandSpec};
use crate::utils::errors::Result;

/// Records every command, answers from a script, and simulates the few
/// pieces of host state restore cares about (users, binaries, databases).
#[derive(Default)]
pub struct FakeRunner {
    calls: RefCell<Vec<CommandSpec>>,
    responses: Vec<(String, CommandOutput)>,
    users: RefCell<BTreeSet<String>>,
    binaries: RefCell<BTreeSet<String>>,
    postgres_dbs: RefCell<BTreeSet<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user: &str) -> Self {
        self.users.borrow_mut().insert(user.to_string());
        self
    }

    pub fn with_binary(self, binary: &str) -> Self {
        self.binaries.borrow_mut().insert(binary.to_string());
        self
    }

    /// Answer commands whose rendering contains `needle` with `stdout`.
    pub fn respond(mut self, needle: &str, stdout: &str) -> Self {
        self.responses.push((needle.to_string(), CommandOutput::ok(stdout)));
        self
    }

    /// Fail commands whose rendering contains `needle`.
    pub fn fail(mut self, needle: &str, stderr: &str) -> Self {
        self.responses
            .push((needle.to_string(), CommandOutput::failed(1, stderr)));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(CommandSpec::display).collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    fn simulate(&self, spec: &CommandSpec) -> Option<CommandOutput> {
        match spec.program.as_str() {
            "useradd" => {
                if let Some(user) = spec.args.last() {
                    if !self.users.borrow_mut().insert(user.clone()) {
                        return Some(CommandOutput::failed(9, format!("useradd: user '{}' already exists", user)));
                    }
                }
                None
            }
            "createdb" => {
                if let Some(db) = spec.args.last() {
                    if !self.postgres_dbs.borrow_mut().insert(db.clone()) {
                        return Some(CommandOutput::failed(
                            1,
                            format!("createdb: error: database \"{}\" already exists", db),
                        ));
                    }
                }
                None
            }
            "apt-get" => {
                for pkg in &spec.args {
                    let binary = match pkg.as_str() {
                        "nodejs" => "node",
                        "postgresql" => "psql",
                        "mysql-server" => "mysql",
                        "docker.io" => "docker",
                        other => other,
                    };
                    self.binaries.borrow_mut().insert(binary.to_string());
                }
                None
            }
            _ => None,
        }
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(spec.clone());
        let line = spec.display();

        let output = self
            .responses
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .or_else(|| self.simulate(spec))
            .unwrap_or_else(|| CommandOutput::ok(""));

        if let Some(path) = &spec.stdout_file {
            std::fs::write(path, &output.stdout)?;
        }
        Ok(output)
    }

    fn user_exists(&self, name: &str) -> bool {
        self.users.borrow().contains(name)
    }

    fn has_binary(&self, name: &str) -> bool {
        self.binaries.borrow().contains(name)
    }
}
