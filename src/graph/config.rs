//! Text pipeline configuration.
//!
//! One statement per line:
//!
//! ```text
//! module  <name> <instance>
//! connect <name0> <inst0> <conn0> <name1> <inst1> <conn1>
//! param   <name> <inst> <param> <values...>
//! ```
//!
//! Identifiers are tokens (at most eight bytes). How param values parse
//! depends on the type the module class declared: `float` reads `cnt`
//! floats, `string` takes the rest of the line (up to `cnt` bytes).
//! Anything else fails the parse, reporting file and line.

use std::fs;
use std::path::Path;

use log::error;

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::params::{PARAM_FLOAT, PARAM_STRING};
use crate::token::Token;

const CMD_MODULE: Token = Token::new("module");
const CMD_CONNECT: Token = Token::new("connect");
const CMD_PARAM: Token = Token::new("param");

/// Reads the full module stack from `path` into `graph`.
pub fn read_config(graph: &mut Graph, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    for (i, line) in text.lines().enumerate() {
        let lno = i as u32 + 1;
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = read_line(graph, line) {
            error!(target: "pipe", "failed in line {}: '{}'", lno, line);
            error!(target: "pipe", "{}", e);
            return Err(Error::Config { file: path.into(), line: lno });
        }
    }
    Ok(())
}

/// Splits off one whitespace-separated field, token-checked.
fn read_token<'a>(line: &mut &'a str) -> Result<Token> {
    let cur = (*line).trim_start();
    let end = cur.find(char::is_whitespace).unwrap_or(cur.len());
    let (field, rest) = cur.split_at(end);
    *line = rest;
    if field.is_empty() || field.len() > 8 {
        return Err(Error::BadToken(field.into()));
    }
    Ok(Token::new(field))
}

fn read_line(graph: &mut Graph, line: &str) -> Result<()> {
    let mut rest = line;
    let cmd = read_token(&mut rest)?;
    if cmd == CMD_MODULE {
        read_module(graph, rest)
    } else if cmd == CMD_CONNECT {
        read_connection(graph, rest)
    } else if cmd == CMD_PARAM {
        read_param(graph, rest)
    } else {
        Err(Error::BadToken(cmd.to_string()))
    }
}

fn read_module(graph: &mut Graph, mut rest: &str) -> Result<()> {
    let name = read_token(&mut rest)?;
    let inst = read_token(&mut rest)?;
    graph.add_module(name, inst)?;
    Ok(())
}

fn read_connection(graph: &mut Graph, mut rest: &str) -> Result<()> {
    let mod0 = read_token(&mut rest)?;
    let inst0 = read_token(&mut rest)?;
    let conn0 = read_token(&mut rest)?;
    let mod1 = read_token(&mut rest)?;
    let inst1 = read_token(&mut rest)?;
    let conn1 = read_token(&mut rest)?;

    let m0 = graph
        .get_module(mod0, inst0)
        .ok_or(Error::NoSuchModule { name: mod0, inst: inst0 })?;
    let m1 = graph
        .get_module(mod1, inst1)
        .ok_or(Error::NoSuchModule { name: mod1, inst: inst1 })?;
    let c0 = graph.modules[m0]
        .connector_index(conn0)
        .map(|c| c as i32)
        .unwrap_or(-1);
    let c1 = graph.modules[m1]
        .connector_index(conn1)
        .map(|c| c as i32)
        .unwrap_or(-1);
    graph.connect(m0 as i32, c0, m1 as i32, c1)
}

fn read_param(graph: &mut Graph, mut rest: &str) -> Result<()> {
    let name = read_token(&mut rest)?;
    let inst = read_token(&mut rest)?;
    let parm = read_token(&mut rest)?;
    let mi = graph
        .get_module(name, inst)
        .ok_or(Error::NoSuchModule { name, inst })?;
    let desc = *graph
        .registry()
        .class(graph.modules[mi].class)
        .param(parm)
        .ok_or(Error::NoSuchParam(parm))?;

    if desc.kind == PARAM_FLOAT {
        let mut values = Vec::with_capacity(desc.cnt as usize);
        for _ in 0..desc.cnt {
            rest = rest.trim_start();
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let (field, r) = rest.split_at(end);
            rest = r;
            values.push(field.parse::<f32>().map_err(|_| Error::BadValue(parm))?);
        }
        graph.set_param_f32(mi, parm, &values)
    } else if desc.kind == PARAM_STRING {
        // the rest of the line, spaces included
        graph.set_param_str(mi, parm, rest.trim_start())
    } else {
        Err(Error::UnknownParamType(desc.kind))
    }
}
