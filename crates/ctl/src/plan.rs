//! Plan configuration (`*.stay.ini`) loading.
//!
//! Three section kinds describe a deployment: `[env:NAME]` lists hosts,
//! apps, and a concurrency ceiling; `[host:ID]` binds a logical host to an
//! agent identity; `[app:NAME]` holds numbered steps (`step1=verb:args`).
//! Step numbers are strictly positive, gaps are skipped, and execution
//! order is ascending.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

/// Required plan file extension.
pub const PLAN_EXTENSION: &str = ".stay.ini";

static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(\w+):([^\]]+)\]$").expect("constant regex pattern is valid"));
static STEP_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^step(\d+)$").expect("constant regex pattern is valid"));

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub environments: HashMap<String, Environment>,
    pub hosts: HashMap<String, Host>,
    pub apps: HashMap<String, App>,
}

#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub name: String,
    pub hosts: Vec<String>,
    pub apps: Vec<String>,
    /// Maximum hosts in flight at once; zero means unlimited.
    pub concurrency: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Host {
    pub id: String,
    agent_id: String,
    pub tags: Vec<String>,
}

impl Host {
    /// Agent identity on the wire; defaults to the host id.
    pub fn agent_id(&self) -> &str {
        if self.agent_id.is_empty() {
            &self.id
        } else {
            &self.agent_id
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct App {
    pub name: String,
    steps: BTreeMap<u32, Step>,
}

impl App {
    /// Steps in ascending step-number order; gaps are naturally skipped.
    pub fn ordered_steps(&self) -> impl Iterator<Item = (u32, &Step)> {
        self.steps.iter().map(|(number, step)| (*number, step))
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Step {
    pub action: String,
    pub args: HashMap<String, String>,
}

pub fn load(path: &Path) -> Result<Plan> {
    let display = path.display().to_string();
    if !display.ends_with(PLAN_EXTENSION) {
        bail!("config file must have {PLAN_EXTENSION} extension: {display}");
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to open config {display}"))?;
    parse(&contents)
}

pub fn parse(contents: &str) -> Result<Plan> {
    let mut plan = Plan::default();
    let mut section: Option<(String, String)> = None;

    for (index, raw_line) in contents.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') {
            let Some(caps) = SECTION_RE.captures(line) else {
                bail!("line {line_no}: invalid section header: {line}");
            };
            let kind = caps[1].to_string();
            let name = caps[2].to_string();
            match kind.as_str() {
                "env" => {
                    plan.environments.insert(
                        name.clone(),
                        Environment {
                            name: name.clone(),
                            ..Environment::default()
                        },
                    );
                }
                "host" => {
                    plan.hosts.insert(
                        name.clone(),
                        Host {
                            id: name.clone(),
                            ..Host::default()
                        },
                    );
                }
                "app" => {
                    plan.apps.insert(
                        name.clone(),
                        App {
                            name: name.clone(),
                            ..App::default()
                        },
                    );
                }
                "security" => {}
                other => bail!("line {line_no}: unknown section type: {other}"),
            }
            section = Some((kind, name));
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            bail!("line {line_no}: invalid key=value: {line}");
        };
        let key = key.trim();
        let value = value.trim();

        let Some((kind, name)) = &section else {
            bail!("line {line_no}: key outside of section");
        };

        match kind.as_str() {
            "env" => {
                let env = plan
                    .environments
                    .get_mut(name)
                    .expect("section insert precedes keys");
                match key {
                    "hosts" => env.hosts = parse_list(value),
                    "apps" => env.apps = parse_list(value),
                    "concurrency" => env.concurrency = parse_concurrency(value, line_no)?,
                    other => bail!("line {line_no}: unknown env key: {other}"),
                }
            }
            "host" => {
                let host = plan.hosts.get_mut(name).expect("section insert precedes keys");
                match key {
                    "agent_id" => host.agent_id = value.to_string(),
                    "tags" => host.tags = parse_list(value),
                    other => bail!("line {line_no}: unknown host key: {other}"),
                }
            }
            "app" => {
                let app = plan.apps.get_mut(name).expect("section insert precedes keys");
                let Some(caps) = STEP_KEY_RE.captures(key) else {
                    bail!("line {line_no}: unknown app key: {key}");
                };
                let number: u32 = caps[1]
                    .parse()
                    .with_context(|| format!("line {line_no}: invalid step number: {key}"))?;
                if number == 0 {
                    bail!("line {line_no}: step number must be positive: {key}");
                }
                let step = parse_step(value)
                    .with_context(|| format!("line {line_no}: invalid step"))?;
                app.steps.insert(number, step);
            }
            "security" => {
                // The secret now comes from the environment; tolerate old
                // configs that still carry the section.
                if key != "secret_key" {
                    bail!("line {line_no}: unknown security key: {key} (section is deprecated)");
                }
            }
            _ => unreachable!("section kinds are validated at the header"),
        }
    }

    Ok(plan)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

fn parse_concurrency(value: &str, line_no: usize) -> Result<usize> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Ok(5),
        "false" | "no" | "off" => Ok(1),
        other => other.parse().with_context(|| {
            format!("line {line_no}: invalid concurrency value: {value} (use true/false or a number)")
        }),
    }
}

/// Parses a step value like `cmd:apt-get install -y nginx` or
/// `write_file:/etc/motd content=hello mode=0644` into the action's
/// argument map.
fn parse_step(value: &str) -> Result<Step> {
    let Some((action, rest)) = value.split_once(':') else {
        bail!("missing ':' separator: {value}");
    };
    let action = action.trim().to_string();
    let rest = rest.trim_start();

    let mut args = HashMap::new();
    match action.as_str() {
        "cmd" => {
            args.insert("command".to_string(), rest.to_string());
        }
        "write_file" | "template_file" => {
            let tokens = shell_tokenize(rest);
            let Some(path) = tokens.first() else {
                bail!("missing path for {action} action");
            };
            args.insert("path".to_string(), path.clone());
            for token in &tokens[1..] {
                if let Some((key, val)) = token.split_once('=') {
                    args.insert(key.to_string(), val.to_string());
                }
            }
        }
        "systemd" => {
            let mut fields = rest.split_whitespace();
            if let Some(sub_action) = fields.next() {
                args.insert("action".to_string(), sub_action.to_string());
            }
            if let Some(unit) = fields.next() {
                args.insert("unit".to_string(), unit.to_string());
            }
        }
        _ => {
            args.insert("command".to_string(), rest.to_string());
        }
    }

    Ok(Step { action, args })
}

/// Splits on spaces while respecting single- and double-quoted spans.
pub fn shell_tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in input.chars() {
        match (ch, quote) {
            ('"' | '\'', None) => quote = Some(ch),
            (ch, Some(open)) if ch == open => quote = None,
            (' ', None) => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
# deployment plan
[env:prod]
hosts = web1, web2
apps = nginx
concurrency = 2

[host:web1]
agent_id = web1.lan
tags = frontend, primary

[host:web2]

[app:nginx]
step1 = cmd:apt-get install -y nginx
step3 = systemd:enable nginx
step2 = write_file:/etc/motd content=\"hello world\" mode=0644
";

    #[test]
    fn parses_sections_and_orders_steps() {
        let plan = parse(SAMPLE).expect("parse");

        let env = &plan.environments["prod"];
        assert_eq!(env.hosts, vec!["web1", "web2"]);
        assert_eq!(env.apps, vec!["nginx"]);
        assert_eq!(env.concurrency, 2);

        assert_eq!(plan.hosts["web1"].agent_id(), "web1.lan");
        assert_eq!(plan.hosts["web2"].agent_id(), "web2");
        assert_eq!(plan.hosts["web1"].tags, vec!["frontend", "primary"]);

        let steps: Vec<_> = plan.apps["nginx"].ordered_steps().collect();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].0, 1);
        assert_eq!(steps[0].1.action, "cmd");
        assert_eq!(steps[1].0, 2);
        assert_eq!(steps[1].1.action, "write_file");
        assert_eq!(steps[2].0, 3);
        assert_eq!(steps[2].1.action, "systemd");
    }

    #[test]
    fn step_gaps_are_skipped() {
        let plan = parse("[app:a]\nstep2 = cmd:echo two\nstep9 = cmd:echo nine\n").expect("parse");
        let numbers: Vec<u32> = plan.apps["a"].ordered_steps().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec![2, 9]);
    }

    #[test]
    fn step_zero_is_rejected() {
        let err = parse("[app:a]\nstep0 = cmd:echo\n").unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn step_args_are_shaped_per_action() {
        let plan = parse(
            "[app:a]\n\
             step1 = write_file:/etc/motd content=\"hello world\" mode=0644\n\
             step2 = systemd:restart nginx\n\
             step3 = cmd:echo a=b stays verbatim\n",
        )
        .expect("parse");

        let steps: Vec<_> = plan.apps["a"].ordered_steps().map(|(_, s)| s).collect();
        assert_eq!(steps[0].args["path"], "/etc/motd");
        assert_eq!(steps[0].args["content"], "hello world");
        assert_eq!(steps[0].args["mode"], "0644");
        assert_eq!(steps[1].args["action"], "restart");
        assert_eq!(steps[1].args["unit"], "nginx");
        assert_eq!(steps[2].args["command"], "echo a=b stays verbatim");
    }

    #[test]
    fn concurrency_accepts_booleans_and_numbers() {
        for (value, expected) in [("true", 5), ("false", 1), ("0", 0), ("7", 7)] {
            let plan = parse(&format!("[env:e]\nconcurrency = {value}\n")).expect("parse");
            assert_eq!(plan.environments["e"].concurrency, expected, "value {value}");
        }
        assert!(parse("[env:e]\nconcurrency = soon\n").is_err());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse("[env prod]\n").is_err(), "bad section header");
        assert!(parse("[widget:x]\n").is_err(), "unknown section kind");
        assert!(parse("hosts = a\n").is_err(), "key outside section");
        assert!(parse("[env:e]\nregion = eu\n").is_err(), "unknown env key");
        assert!(parse("[app:a]\nstep1 = echo hi\n").is_err(), "missing colon");
    }

    #[test]
    fn shell_tokenize_respects_quotes() {
        assert_eq!(
            shell_tokenize("/etc/motd content=\"hello world\" owner='web admin'"),
            vec!["/etc/motd", "content=hello world", "owner=web admin"]
        );
        assert_eq!(shell_tokenize("  a   b "), vec!["a", "b"]);
        assert!(shell_tokenize("").is_empty());
    }

    #[test]
    fn load_enforces_the_plan_extension() {
        let mut file = tempfile::Builder::new()
            .suffix(".ini")
            .tempfile()
            .expect("tempfile");
        writeln!(file, "[env:e]").expect("write");

        let err = load(file.path()).unwrap_err();
        assert!(err.to_string().contains(".stay.ini"));
    }

    #[test]
    fn load_reads_a_plan_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".stay.ini")
            .tempfile()
            .expect("tempfile");
        write!(file, "{SAMPLE}").expect("write");

        let plan = load(file.path()).expect("load");
        assert!(plan.environments.contains_key("prod"));
    }
}
