//! Interactive launch dialog on stdin/stdout.

use std::io::Write;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use remote_kernel::commands::{LaunchMode, LaunchPrompt, PromptAnswer};
use remote_kernel::launch::{LaunchRequest, Offerings};

/// Asks for every field of a launch request, offering the defaults.
///
/// Empty input keeps the default. End of input dismisses the dialog.
pub struct TerminalPrompt {
    /// Offer attaching to the current notebook instead of a new one.
    pub has_session: bool,
}

type Input = Lines<BufReader<Stdin>>;

async fn ask(input: &mut Input, label: &str, default: &str) -> Result<Option<String>> {
    if default.is_empty() {
        print!("{label}: ");
    } else {
        print!("{label} [{default}]: ");
    }
    std::io::stdout().flush()?;

    match input.next_line().await? {
        None => Ok(None),
        Some(line) if line.trim().is_empty() => Ok(Some(default.to_string())),
        Some(line) => Ok(Some(line.trim().to_string())),
    }
}

#[async_trait]
impl LaunchPrompt for TerminalPrompt {
    async fn prompt(
        &self,
        offerings: &Offerings,
        defaults: &LaunchRequest,
    ) -> Result<Option<PromptAnswer>> {
        let mut input = BufReader::new(tokio::io::stdin()).lines();

        println!("Clusters:");
        for (i, cluster) in offerings.clusters().enumerate() {
            println!("  {}) {}", i + 1, cluster);
        }

        let Some(choice) = ask(&mut input, "Cluster", &defaults.cluster).await? else {
            return Ok(None);
        };
        let cluster = match choice.parse::<usize>() {
            Ok(n) if n >= 1 => offerings
                .clusters()
                .nth(n - 1)
                .map(str::to_string)
                .unwrap_or(choice),
            _ => choice,
        };

        let mut request = if cluster == defaults.cluster {
            defaults.clone()
        } else {
            match offerings.default_request(&cluster) {
                Some(request) => request,
                None => anyhow::bail!("Cluster {cluster} is not offered"),
            }
        };

        let Some(workdir) = ask(&mut input, "Working directory", &request.workdir).await? else {
            return Ok(None);
        };
        request.workdir = workdir;
        let Some(exec_path) = ask(&mut input, "Executable path", &request.exec_path).await? else {
            return Ok(None);
        };
        request.exec_path = exec_path;
        let Some(user_scripts) = ask(&mut input, "User scripts", &request.user_scripts).await?
        else {
            return Ok(None);
        };
        request.user_scripts = user_scripts;

        let resources: Vec<(String, String)> = request
            .resources
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (key, value) in resources {
            let Some(answer) = ask(&mut input, &key, &value).await? else {
                return Ok(None);
            };
            request.set_resource(&key, answer)?;
        }

        let mode = if self.has_session {
            let Some(answer) =
                ask(&mut input, "Attach to (n)ew notebook or (c)urrent", "n").await?
            else {
                return Ok(None);
            };
            if answer.starts_with('c') {
                LaunchMode::CurrentSession
            } else {
                LaunchMode::NewDocument
            }
        } else {
            LaunchMode::NewDocument
        };

        let Some(confirm) = ask(&mut input, "Launch? (y/n)", "y").await? else {
            return Ok(None);
        };
        if !confirm.eq_ignore_ascii_case("y") && !confirm.eq_ignore_ascii_case("yes") {
            return Ok(None);
        }

        Ok(Some(PromptAnswer { request, mode }))
    }
}
