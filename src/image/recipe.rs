//! Build recipe parser (Dockerfile syntax)

use crate::error::{Result, TandemError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One recipe instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// FROM: base image
    From {
        image: String,
        tag: Option<String>,
        alias: Option<String>,
    },
    /// RUN: build-time command
    Run { command: String, shell: bool },
    /// COPY / ADD: bring files from the context
    Copy {
        src: Vec<String>,
        dest: String,
        from: Option<String>,
    },
    /// CMD: default launch command
    Cmd { command: Vec<String>, shell: bool },
    /// ENTRYPOINT
    Entrypoint { command: Vec<String>, shell: bool },
    /// ENV
    Env { key: String, value: String },
    /// ARG
    Arg { name: String, default: Option<String> },
    /// WORKDIR
    Workdir { path: String },
    /// USER
    User { user: String },
    /// EXPOSE: declared listening port
    Expose { port: u16, protocol: String },
    /// VOLUME
    Volume { paths: Vec<String> },
    /// LABEL
    Label { labels: BTreeMap<String, String> },
    /// Any other keyword, kept verbatim
    Other { keyword: String, args: String },
}

/// One FROM-delimited stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeStage {
    pub name: Option<String>,
    pub base_image: String,
    pub base_tag: Option<String>,
    pub instructions: Vec<Instruction>,
}

/// Parsed build recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecipe {
    pub stages: Vec<RecipeStage>,
}

impl BuildRecipe {
    /// Read and parse a recipe file
    pub fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse recipe content
    pub fn parse(content: &str) -> Result<Self> {
        let mut stages = Vec::new();
        let mut current: Option<RecipeStage> = None;
        let mut continued = String::new();
        let mut continued_from = 0;

        for (idx, line) in content.lines().enumerate() {
            let line_num = idx + 1;
            let line = line.trim();

            if line.starts_with('#') || (line.is_empty() && continued.is_empty()) {
                continue;
            }

            if let Some(head) = line.strip_suffix('\\') {
                if continued.is_empty() {
                    continued_from = line_num;
                }
                continued.push_str(head);
                continued.push(' ');
                continue;
            }

            let (full_line, start_line) = if continued.is_empty() {
                (line.to_string(), line_num)
            } else {
                let joined = format!("{}{}", continued, line);
                continued.clear();
                (joined, continued_from)
            };
            if full_line.trim().is_empty() {
                continue;
            }

            match parse_instruction(full_line.trim(), start_line)? {
                Instruction::From { image, tag, alias } => {
                    if let Some(stage) = current.take() {
                        stages.push(stage);
                    }
                    current = Some(RecipeStage {
                        name: alias,
                        base_image: image,
                        base_tag: tag,
                        instructions: Vec::new(),
                    });
                }
                Instruction::Arg { .. } if current.is_none() => {
                    // ARG before the first FROM parameterises FROM itself
                }
                instruction => match current.as_mut() {
                    Some(stage) => stage.instructions.push(instruction),
                    None => {
                        return Err(TandemError::RecipeParse {
                            line: start_line,
                            message: "Instruction before FROM".to_string(),
                        })
                    }
                },
            }
        }

        if let Some(stage) = current {
            stages.push(stage);
        }

        if stages.is_empty() {
            return Err(TandemError::RecipeParse {
                line: 0,
                message: "No FROM instruction found".to_string(),
            });
        }

        Ok(Self { stages })
    }

    /// The stage that produces the runnable artifact
    fn final_stage(&self) -> Option<&RecipeStage> {
        self.stages.last()
    }

    /// Ports the final stage declares with EXPOSE
    pub fn exposed_ports(&self) -> Vec<u16> {
        self.final_instructions()
            .filter_map(|i| match i {
                Instruction::Expose { port, .. } => Some(*port),
                _ => None,
            })
            .collect()
    }

    /// Launch command of the final stage: ENTRYPOINT followed by CMD
    pub fn default_command(&self) -> Option<Vec<String>> {
        let mut entrypoint = None;
        let mut cmd = None;
        for instruction in self.final_instructions() {
            match instruction {
                Instruction::Entrypoint { command, shell } => entrypoint = Some(shell_form(command, *shell)),
                Instruction::Cmd { command, shell } => cmd = Some(shell_form(command, *shell)),
                _ => {}
            }
        }
        match (entrypoint, cmd) {
            (None, None) => None,
            (entrypoint, cmd) => Some(entrypoint.into_iter().chain(cmd).flatten().collect()),
        }
    }

    fn final_instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.final_stage()
            .into_iter()
            .flat_map(|stage| stage.instructions.iter())
    }
}

fn shell_form(command: &[String], shell: bool) -> Vec<String> {
    if shell {
        let mut v = vec!["/bin/sh".to_string(), "-c".to_string()];
        v.extend(command.iter().cloned());
        v
    } else {
        command.to_vec()
    }
}

fn parse_instruction(line: &str, line_num: usize) -> Result<Instruction> {
    let (keyword, args) = match line.split_once(char::is_whitespace) {
        Some((k, a)) => (k, a.trim()),
        None => (line, ""),
    };
    let keyword = keyword.to_uppercase();

    match keyword.as_str() {
        "FROM" => parse_from(args, line_num),
        "RUN" => Ok(Instruction::Run {
            command: args.to_string(),
            shell: !args.starts_with('['),
        }),
        "COPY" | "ADD" => parse_copy(args, line_num),
        "CMD" => {
            let (command, shell) = parse_command(args, line_num)?;
            Ok(Instruction::Cmd { command, shell })
        }
        "ENTRYPOINT" => {
            let (command, shell) = parse_command(args, line_num)?;
            Ok(Instruction::Entrypoint { command, shell })
        }
        "ENV" => parse_env(args, line_num),
        "ARG" => Ok(match args.split_once('=') {
            Some((name, default)) => Instruction::Arg {
                name: name.trim().to_string(),
                default: Some(default.trim().to_string()),
            },
            None => Instruction::Arg {
                name: args.to_string(),
                default: None,
            },
        }),
        "WORKDIR" => Ok(Instruction::Workdir {
            path: args.to_string(),
        }),
        "USER" => Ok(Instruction::User {
            user: args.to_string(),
        }),
        "EXPOSE" => parse_expose(args, line_num),
        "VOLUME" => Ok(Instruction::Volume {
            paths: if args.starts_with('[') {
                json_array(args, line_num)?
            } else {
                args.split_whitespace().map(str::to_string).collect()
            },
        }),
        "LABEL" => Ok(Instruction::Label {
            labels: args
                .split_whitespace()
                .filter_map(|part| part.split_once('='))
                .map(|(k, v)| (k.to_string(), v.trim_matches('"').to_string()))
                .collect(),
        }),
        _ if keyword.chars().all(|c| c.is_ascii_alphabetic()) => Ok(Instruction::Other {
            keyword,
            args: args.to_string(),
        }),
        _ => Err(TandemError::RecipeParse {
            line: line_num,
            message: format!("Unknown instruction: {}", keyword),
        }),
    }
}

fn parse_from(args: &str, line_num: usize) -> Result<Instruction> {
    let parts: Vec<&str> = args
        .split_whitespace()
        .filter(|p| !p.starts_with("--"))
        .collect();
    let Some(reference) = parts.first() else {
        return Err(TandemError::RecipeParse {
            line: line_num,
            message: "FROM requires an image".to_string(),
        });
    };

    // A colon after the last slash separates the tag; earlier colons belong
    // to a registry host:port.
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (image, tag) = match reference[name_start..].split_once(':') {
        Some((name, tag)) => (
            format!("{}{}", &reference[..name_start], name),
            Some(tag.to_string()),
        ),
        None => (reference.to_string(), None),
    };

    let alias = match parts.as_slice() {
        [_, kw, alias, ..] if kw.eq_ignore_ascii_case("AS") => Some(alias.to_string()),
        _ => None,
    };

    Ok(Instruction::From { image, tag, alias })
}

fn parse_copy(args: &str, line_num: usize) -> Result<Instruction> {
    let mut from = None;
    let mut paths = Vec::new();
    for part in args.split_whitespace() {
        if let Some(stage) = part.strip_prefix("--from=") {
            from = Some(stage.to_string());
        } else if !part.starts_with("--") {
            paths.push(part.to_string());
        }
    }

    let Some(dest) = paths.pop() else {
        return Err(TandemError::RecipeParse {
            line: line_num,
            message: "COPY requires a source and a destination".to_string(),
        });
    };
    if paths.is_empty() {
        return Err(TandemError::RecipeParse {
            line: line_num,
            message: "COPY requires a source and a destination".to_string(),
        });
    }

    Ok(Instruction::Copy {
        src: paths,
        dest,
        from,
    })
}

fn parse_command(args: &str, line_num: usize) -> Result<(Vec<String>, bool)> {
    if args.starts_with('[') {
        Ok((json_array(args, line_num)?, false))
    } else {
        Ok((vec![args.to_string()], true))
    }
}

fn json_array(args: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(args).map_err(|e| TandemError::RecipeParse {
        line: line_num,
        message: format!("invalid JSON array: {}", e),
    })
}

fn parse_env(args: &str, line_num: usize) -> Result<Instruction> {
    let (key, value) = match args.split_once('=') {
        Some((k, v)) => (k.trim(), v.trim().trim_matches('"')),
        None => args
            .split_once(char::is_whitespace)
            .map(|(k, v)| (k, v.trim()))
            .ok_or_else(|| TandemError::RecipeParse {
                line: line_num,
                message: "ENV requires a key and value".to_string(),
            })?,
    };

    Ok(Instruction::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_expose(args: &str, line_num: usize) -> Result<Instruction> {
    let first = args.split_whitespace().next().unwrap_or("");
    let (port, protocol) = first.split_once('/').unwrap_or((first, "tcp"));
    let port: u16 = port.parse().map_err(|_| TandemError::RecipeParse {
        line: line_num,
        message: format!("Invalid port number: {}", port),
    })?;

    Ok(Instruction::Expose {
        port,
        protocol: protocol.to_string(),
    })
}
