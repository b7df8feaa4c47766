// Copyright (C) 2026 tollgate developers
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! nftables backend. The whole policy is rendered as a single script and
//! handed to `nft -f -`, so the ruleset swap is atomic: either the new
//! tables replace the old ones entirely or nothing changes.

use std::fmt::Write as _;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{FamilyPolicy, FirewallError, run_command};

const TABLE: &str = "tollgate";

pub(super) async fn probe() -> bool {
    run_command("nft", &["list".to_string(), "tables".to_string()])
        .await
        .is_ok()
}

pub(super) async fn apply(
    v4: Option<&FamilyPolicy>,
    v6: Option<&FamilyPolicy>,
) -> Result<(), FirewallError> {
    let script = render_script(v4, v6);
    debug!(script = %script, "applying nftables ruleset");

    let rendered = "nft -f -".to_string();
    let mut child = Command::new("nft")
        .args(["-f", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| FirewallError::Spawn {
            command: rendered.clone(),
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|source| FirewallError::Spawn {
                command: rendered.clone(),
                source,
            })?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| FirewallError::Spawn {
            command: rendered.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(FirewallError::CommandFailed {
            command: rendered,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Render the full replacement script for both families.
///
/// Each family gets the declare-then-delete-then-define sequence: the
/// empty declaration makes the subsequent delete succeed even on a host
/// where the table does not exist yet, and the final definition holds the
/// actual chains. Families without a configured subnet are left out
/// entirely.
fn render_script(v4: Option<&FamilyPolicy>, v6: Option<&FamilyPolicy>) -> String {
    let mut script = String::new();
    if let Some(policy) = v4 {
        render_family(&mut script, "ip", policy);
    }
    if let Some(policy) = v6 {
        render_family(&mut script, "ip6", policy);
    }
    script
}

fn render_family(script: &mut String, family: &str, policy: &FamilyPolicy) {
    let saddr = match family {
        "ip" => "ip saddr",
        _ => "ip6 saddr",
    };
    let daddr = match family {
        "ip" => "ip daddr",
        _ => "ip6 daddr",
    };
    let cidr = policy.cidr.as_str();

    let _ = writeln!(script, "table {family} {TABLE}");
    let _ = writeln!(script, "delete table {family} {TABLE}");
    let _ = writeln!(script, "table {family} {TABLE} {{");

    let _ = writeln!(script, "  chain forward {{");
    let _ = writeln!(script, "    type filter hook forward priority filter;");
    if policy.client_isolation {
        let _ = writeln!(script, "    {saddr} {cidr} {daddr} {cidr} reject");
    }
    for allowed in &policy.allowed {
        let _ = writeln!(script, "    {saddr} {cidr} {daddr} {allowed} accept");
        if !policy.nat {
            let _ = writeln!(script, "    {saddr} {allowed} {daddr} {cidr} accept");
        }
    }
    let _ = writeln!(script, "    {saddr} {cidr} reject");
    let _ = writeln!(script, "  }}");

    let _ = writeln!(script, "  chain postrouting {{");
    let _ = writeln!(script, "    type nat hook postrouting priority srcnat;");
    if let (Some(gateway), true) = (&policy.gateway_iface, policy.nat) {
        let _ = writeln!(
            script,
            "    {saddr} {cidr} oifname \"{gateway}\" masquerade"
        );
    }
    let _ = writeln!(script, "  }}");
    let _ = writeln!(script, "}}");
}
