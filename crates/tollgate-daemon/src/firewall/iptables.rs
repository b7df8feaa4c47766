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

//! iptables backend. All managed rules live in dedicated chains that are
//! flushed and rebuilt on every apply; the only rules touched outside
//! them are the jumps wired into FORWARD and POSTROUTING.

use tracing::debug;

use super::{FamilyPolicy, FirewallError, run_command};

const FORWARD_CHAIN: &str = "TOLLGATE_FORWARD";
const POSTROUTING_CHAIN: &str = "TOLLGATE_POSTROUTING";

pub(super) async fn probe() -> bool {
    run_command("iptables", &args(&["-t", "filter", "-n", "-L"]))
        .await
        .is_ok()
}

pub(super) async fn apply(
    v4: Option<&FamilyPolicy>,
    v6: Option<&FamilyPolicy>,
) -> Result<(), FirewallError> {
    if let Some(policy) = v4 {
        apply_family("iptables", policy).await?;
    }
    if let Some(policy) = v6 {
        apply_family("ip6tables", policy).await?;
    }
    Ok(())
}

async fn apply_family(binary: &str, policy: &FamilyPolicy) -> Result<(), FirewallError> {
    debug!(binary, cidr = %policy.cidr, "rebuilding firewall chains");

    ensure_chain(binary, "filter", FORWARD_CHAIN).await?;
    ensure_chain(binary, "nat", POSTROUTING_CHAIN).await?;

    append_unique(
        binary,
        "filter",
        "FORWARD",
        &args(&["-j", FORWARD_CHAIN]),
    )
    .await?;
    append_unique(
        binary,
        "nat",
        "POSTROUTING",
        &args(&["-j", POSTROUTING_CHAIN]),
    )
    .await?;

    for rule in forward_rules(policy) {
        let mut cmd = args(&["-t", "filter", "-A", FORWARD_CHAIN]);
        cmd.extend(rule);
        run_command(binary, &cmd).await?;
    }
    for rule in postrouting_rules(policy) {
        let mut cmd = args(&["-t", "nat", "-A", POSTROUTING_CHAIN]);
        cmd.extend(rule);
        run_command(binary, &cmd).await?;
    }
    Ok(())
}

/// Create the chain if needed and flush whatever it held.
async fn ensure_chain(binary: &str, table: &str, chain: &str) -> Result<(), FirewallError> {
    // -N fails when the chain exists, which is fine
    let _ = run_command(binary, &args(&["-t", table, "-N", chain])).await;
    run_command(binary, &args(&["-t", table, "-F", chain])).await?;
    Ok(())
}

/// Append a rule unless an identical one is already present.
async fn append_unique(
    binary: &str,
    table: &str,
    chain: &str,
    rule: &[String],
) -> Result<(), FirewallError> {
    let mut check = args(&["-t", table, "-C", chain]);
    check.extend_from_slice(rule);
    if run_command(binary, &check).await.is_ok() {
        return Ok(());
    }
    let mut append = args(&["-t", table, "-A", chain]);
    append.extend_from_slice(rule);
    run_command(binary, &append).await?;
    Ok(())
}

/// The filter rules for one family, in evaluation order: optional client
/// isolation, one accept per allowed destination (with the return leg
/// when NAT is off), then a terminal reject for everything else.
fn forward_rules(policy: &FamilyPolicy) -> Vec<Vec<String>> {
    let mut rules = Vec::new();
    let cidr = policy.cidr.as_str();

    if policy.client_isolation {
        rules.push(args(&["-s", cidr, "-d", cidr, "-j", "REJECT"]));
    }

    for allowed in &policy.allowed {
        rules.push(args(&["-s", cidr, "-d", allowed, "-j", "ACCEPT"]));
        if !policy.nat {
            // without masquerading the reply path needs its own accept
            rules.push(args(&["-s", allowed, "-d", cidr, "-j", "ACCEPT"]));
        }
    }

    rules.push(args(&["-s", cidr, "-j", "REJECT"]));
    rules
}

fn postrouting_rules(policy: &FamilyPolicy) -> Vec<Vec<String>> {
    match (&policy.gateway_iface, policy.nat) {
        (Some(gateway), true) => vec![args(&[
            "-s",
            &policy.cidr,
            "-o",
            gateway,
            "-j",
            "MASQUERADE",
        ])],
        _ => Vec::new(),
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
