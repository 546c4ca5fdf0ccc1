//! Minimal interactive REPL wrapping `EXECUTE_REPL_COMMAND` (spec.md §4.6):
//! `read <node_id>`, `show`, `validate <graph_id>`, `dry <graph_id>`, plus
//! `exec <node_id> <input...>` and `quit`.

use std::io::{self, BufRead, Write};

use nerve::command::Command;
use serde_json::json;

use crate::backend::RunBackend;
use crate::{execute_input_command, exit_code};

/// Runs the REPL against `backend` until `quit`/EOF, printing each
/// response's `data` (on success) or `error` (on failure) as JSON.
pub async fn run(backend: &dyn RunBackend) -> i32 {
    let stdin = io::stdin();
    let mut last_code = 0;
    print!("nerve> ");
    let _ = io::stdout().flush();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            print!("nerve> ");
            let _ = io::stdout().flush();
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        let command = match parse_line(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                println!("{{\"error\": \"{e}\"}}");
                last_code = 1;
                print!("nerve> ");
                let _ = io::stdout().flush();
                continue;
            }
        };
        let response = backend.send(command).await;
        last_code = exit_code(&response);
        match serde_json::to_string(&response) {
            Ok(text) => println!("{text}"),
            Err(e) => println!("{{\"error\": \"{e}\"}}"),
        }
        print!("nerve> ");
        let _ = io::stdout().flush();
    }
    last_code
}

fn parse_line(line: &str) -> Result<Command, String> {
    let mut parts = line.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    match verb {
        "read" | "validate" | "dry" => {
            if rest.is_empty() {
                return Err(format!("'{verb}' requires an id argument"));
            }
            let key = if verb == "read" { "node_id" } else { "graph_id" };
            Ok(Command {
                command_type: "EXECUTE_REPL_COMMAND".to_string(),
                params: json!({"verb": verb, key: rest}),
            })
        }
        "show" => Ok(Command {
            command_type: "EXECUTE_REPL_COMMAND".to_string(),
            params: json!({"verb": "show"}),
        }),
        "exec" => {
            let mut fields = rest.splitn(2, char::is_whitespace);
            let node_id = fields.next().unwrap_or("").trim();
            let input = fields.next().unwrap_or("").trim();
            if node_id.is_empty() {
                return Err("'exec' requires a node id".to_string());
            }
            Ok(execute_input_command(node_id, input))
        }
        other => Err(format!("unrecognized REPL verb '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_read_builds_repl_command_with_node_id() {
        let command = parse_line("read alpha").unwrap();
        assert_eq!(command.command_type, "EXECUTE_REPL_COMMAND");
        assert_eq!(command.params["verb"], "read");
        assert_eq!(command.params["node_id"], "alpha");
    }

    #[test]
    fn parse_show_takes_no_argument() {
        let command = parse_line("show").unwrap();
        assert_eq!(command.params["verb"], "show");
    }

    #[test]
    fn parse_exec_splits_node_id_and_input() {
        let command = parse_line("exec alpha hello world").unwrap();
        assert_eq!(command.command_type, "EXECUTE_INPUT");
        assert_eq!(command.params["node_id"], "alpha");
        assert_eq!(command.params["input"], "hello world");
    }

    #[test]
    fn parse_rejects_unknown_verb() {
        assert!(parse_line("frobnicate alpha").is_err());
    }

    #[test]
    fn parse_rejects_read_without_id() {
        assert!(parse_line("read").is_err());
    }
}
