//! Configuration languages (§6.6 for the HSM driver; a thin `key = value`
//! front end shared with the map parser's textual style). Small
//! hand-written recursive-descent parsers, grounded in the pack's
//! `spkenv-spk` VFS-router style of pure-function parsers (see DESIGN.md).

use std::collections::HashMap;

use crate::error::{BrokerError, Result};

/// One `remote "name" { ... }` block (§6.6).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteConfig {
    pub name: String,
    pub archive_exec: Option<String>,
    pub release_exec: Option<String>,
    pub stage_exec: Option<String>,
    pub recycle_exec: Option<String>,
}

/// One `mount "/path" { ... }` block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountConfig {
    pub path: String,
    pub local: Option<String>,
    pub remotes: Vec<RemoteConfig>,
}

/// Top-level HSM daemon config (§6.6).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HsmConfig {
    pub pidfile: Option<String>,
    pub maxproc: u32,
    pub mounts: Vec<MountConfig>,
}

/// A minimal tokenizer sufficient for §6.6's shape: identifiers, quoted
/// strings, numbers, and the punctuation `{ } =`. No nested comments, no
/// escapes inside strings beyond `\"`.
struct Tokenizer<'a> {
    rest: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Num(i64),
    LBrace,
    RBrace,
    Eq,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Tokenizer { rest: input }
    }

    fn skip_ignorable(&mut self) {
        loop {
            self.rest = self.rest.trim_start();
            if let Some(stripped) = self.rest.strip_prefix('#') {
                self.rest = stripped.split_once('\n').map(|(_, r)| r).unwrap_or("");
                continue;
            }
            break;
        }
    }

    fn next(&mut self) -> Result<Option<Token>> {
        self.skip_ignorable();
        let Some(c) = self.rest.chars().next() else {
            return Ok(None);
        };
        match c {
            '{' => {
                self.rest = &self.rest[1..];
                Ok(Some(Token::LBrace))
            }
            '}' => {
                self.rest = &self.rest[1..];
                Ok(Some(Token::RBrace))
            }
            '=' => {
                self.rest = &self.rest[1..];
                Ok(Some(Token::Eq))
            }
            '"' => {
                let mut chars = self.rest[1..].char_indices();
                let mut out = String::new();
                loop {
                    match chars.next() {
                        Some((i, '"')) => {
                            self.rest = &self.rest[1 + i + 1..];
                            return Ok(Some(Token::Str(out)));
                        }
                        Some((i, '\\')) => {
                            let (_, next_c) = chars
                                .next()
                                .ok_or_else(|| BrokerError::BadInput("unterminated escape".into()))?;
                            out.push(next_c);
                            let _ = i;
                        }
                        Some((_, c)) => out.push(c),
                        None => return Err(BrokerError::BadInput("unterminated string literal".into())),
                    }
                }
            }
            c if c.is_ascii_digit() || c == '-' => {
                let end = self.rest[1..]
                    .find(|c: char| !c.is_ascii_digit())
                    .map(|i| i + 1)
                    .unwrap_or(self.rest.len());
                let (tok, rest) = self.rest.split_at(end);
                self.rest = rest;
                let n = tok
                    .parse::<i64>()
                    .map_err(|_| BrokerError::BadInput(format!("bad number `{tok}`")))?;
                Ok(Some(Token::Num(n)))
            }
            c if c.is_alphanumeric() || c == '_' => {
                let end = self
                    .rest
                    .find(|c: char| !(c.is_alphanumeric() || c == '_'))
                    .unwrap_or(self.rest.len());
                let (tok, rest) = self.rest.split_at(end);
                self.rest = rest;
                Ok(Some(Token::Ident(tok.to_string())))
            }
            other => Err(BrokerError::BadInput(format!("unexpected character `{other}`"))),
        }
    }
}

/// Parses a `remote "name" { key = value ... }` block body, given the name
/// already consumed.
fn parse_remote_body(tok: &mut Tokenizer, name: String) -> Result<RemoteConfig> {
    let mut remote = RemoteConfig { name, ..Default::default() };
    expect(tok, Token::LBrace)?;
    loop {
        match tok.next()? {
            Some(Token::RBrace) => break,
            Some(Token::Ident(key)) => {
                expect(tok, Token::Eq)?;
                let value = expect_string(tok)?;
                match key.as_str() {
                    "archive_exec" => remote.archive_exec = Some(value),
                    "release_exec" => remote.release_exec = Some(value),
                    "stage_exec" => remote.stage_exec = Some(value),
                    "recycle_exec" => remote.recycle_exec = Some(value),
                    other => return Err(BrokerError::BadInput(format!("unknown remote key `{other}`"))),
                }
            }
            other => return Err(BrokerError::BadInput(format!("unexpected token in remote block: {other:?}"))),
        }
    }
    Ok(remote)
}

fn parse_mount_body(tok: &mut Tokenizer, path: String) -> Result<MountConfig> {
    let mut mount = MountConfig { path, ..Default::default() };
    expect(tok, Token::LBrace)?;
    loop {
        match tok.next()? {
            Some(Token::RBrace) => break,
            Some(Token::Ident(key)) if key == "local" => {
                expect(tok, Token::Eq)?;
                mount.local = Some(expect_string(tok)?);
            }
            Some(Token::Ident(key)) if key == "remote" => {
                let name = expect_string(tok)?;
                mount.remotes.push(parse_remote_body(tok, name)?);
            }
            other => return Err(BrokerError::BadInput(format!("unexpected token in mount block: {other:?}"))),
        }
    }
    Ok(mount)
}

fn expect(tok: &mut Tokenizer, want: Token) -> Result<()> {
    match tok.next()? {
        Some(t) if t == want => Ok(()),
        other => Err(BrokerError::BadInput(format!("expected {want:?}, got {other:?}"))),
    }
}

fn expect_string(tok: &mut Tokenizer) -> Result<String> {
    match tok.next()? {
        Some(Token::Str(s)) => Ok(s),
        other => Err(BrokerError::BadInput(format!("expected string literal, got {other:?}"))),
    }
}

/// Parses the HSM driver config of §6.6.
pub fn parse_hsm_config(text: &str) -> Result<HsmConfig> {
    let mut tok = Tokenizer::new(text);
    let mut cfg = HsmConfig {
        maxproc: 1,
        ..Default::default()
    };
    loop {
        match tok.next()? {
            None => break,
            Some(Token::Ident(key)) if key == "pidfile" => {
                expect(&mut tok, Token::Eq)?;
                cfg.pidfile = Some(expect_string(&mut tok)?);
            }
            Some(Token::Ident(key)) if key == "maxproc" => {
                expect(&mut tok, Token::Eq)?;
                match tok.next()? {
                    Some(Token::Num(n)) if n > 0 => cfg.maxproc = n as u32,
                    other => return Err(BrokerError::BadInput(format!("bad maxproc value: {other:?}"))),
                }
            }
            Some(Token::Ident(key)) if key == "mount" => {
                let path = expect_string(&mut tok)?;
                cfg.mounts.push(parse_mount_body(&mut tok, path)?);
            }
            other => return Err(BrokerError::BadInput(format!("unexpected top-level token: {other:?}"))),
        }
    }
    Ok(cfg)
}

/// Action-dispatch convenience: `%mount`/`%relpath` substitution used when
/// building a remote's `*_exec` command line (§6.6).
pub fn expand_exec_template(template: &str, mount: &str, relpath: &str) -> String {
    template.replace("%mount", mount).replace("%relpath", relpath)
}

pub type DefinedOptions = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
pidfile  = "/var/run/hsmd.pid"
maxproc  = 30
mount "/scratch" { local = "/backing/scratch"
  remote "s3" {
    archive_exec = "/usr/libexec/hsm/s3-archive %mount %relpath"
    release_exec = "/usr/libexec/hsm/s3-release %mount %relpath"
    stage_exec   = "/usr/libexec/hsm/s3-stage   %mount %relpath"
    recycle_exec = "/usr/libexec/hsm/s3-recycle %mount %relpath"
  }
}
"#;

    #[test]
    fn parses_sample_config() {
        let cfg = parse_hsm_config(SAMPLE).unwrap();
        assert_eq!(cfg.pidfile.as_deref(), Some("/var/run/hsmd.pid"));
        assert_eq!(cfg.maxproc, 30);
        assert_eq!(cfg.mounts.len(), 1);
        let mount = &cfg.mounts[0];
        assert_eq!(mount.path, "/scratch");
        assert_eq!(mount.local.as_deref(), Some("/backing/scratch"));
        assert_eq!(mount.remotes.len(), 1);
        assert_eq!(mount.remotes[0].name, "s3");
        assert!(mount.remotes[0].archive_exec.is_some());
    }

    #[test]
    fn rejects_unknown_remote_key() {
        let bad = r#"mount "/x" { remote "r" { bogus_exec = "y" } }"#;
        assert!(parse_hsm_config(bad).is_err());
    }

    #[test]
    fn exec_template_substitution() {
        let out = expand_exec_template("/bin/archive %mount %relpath", "/scratch", "a/b");
        assert_eq!(out, "/bin/archive /scratch a/b");
    }
}
