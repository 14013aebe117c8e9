//! Guest-side network policy self-check, run inside the sandbox VM to prove
//! the DNS allowlist/sinkhole, HTTP proxy allow/deny, metadata blackhole,
//! and direct-egress block are all in effect before a task is evaluated.
//!
//! Grounded on `net_checks.py`'s `run_checks`: same eleven assertions in
//! the same order, same guest log line prefix, same exit codes.

use std::net::ToSocketAddrs;
use std::time::Duration;

use clap::Parser;

#[derive(Parser)]
#[command(name = "guest-netcheck", about = "AlphaCore guest network-policy self-checks")]
struct Args {
    #[arg(long, env = "ACORE_NET_CHECK_TIMEOUT", default_value_t = 5)]
    timeout: u64,

    #[arg(long, env = "PROXY_URL", default_value = "http://172.16.0.1:8888")]
    proxy_url: String,

    #[arg(long, env = "ACORE_STATIC_DNS", default_value = "172.16.0.1")]
    dns_ip: String,
}

fn guest_log(message: impl AsRef<str>) {
    println!("[Guest] {}", message.as_ref());
}

/// Resolves a hostname's first IPv4 address, matching `_resolve_ipv4`:
/// any resolution failure (including dnsmasq sinkholing to 0.0.0.0) yields
/// an empty string rather than an error.
fn resolve_ipv4(hostname: &str) -> String {
    (hostname, 0u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()))
        .map(|a| a.ip().to_string())
        .unwrap_or_default()
}

/// Issues a GET through `client` and returns the HTTP status code as a
/// three-digit string, or `"000"` on any connect/timeout/protocol failure
/// (curl's `-w %{http_code}` convention in the original).
async fn curl_code(url: &str, timeout_s: u64, proxy_url: Option<&str>) -> String {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(timeout_s.max(1)));
    builder = match proxy_url {
        Some(proxy) => match reqwest::Proxy::all(proxy) {
            Ok(p) => builder.proxy(p),
            Err(_) => return "000".into(),
        },
        None => builder.no_proxy(),
    };

    let client = match builder.build() {
        Ok(client) => client,
        Err(_) => return "000".into(),
    };

    match client.get(url).send().await {
        Ok(resp) => format!("{:03}", resp.status().as_u16()),
        Err(_) => "000".into(),
    }
}

async fn run_checks(args: &Args) -> i32 {
    let timeout_s = args.timeout.max(1);
    let proxy = args.proxy_url.as_str();

    let google_ip = resolve_ipv4("googleapis.com");
    guest_log(format!("DNS: googleapis.com -> {}", if google_ip.is_empty() { "empty" } else { &google_ip }));
    if google_ip.is_empty() || google_ip == "0.0.0.0" {
        guest_log(format!("ERROR: DNS allowlist failed: googleapis.com resolved to '{}'.", if google_ip.is_empty() { "empty" } else { &google_ip }));
        return 1;
    }

    let compute_ip = resolve_ipv4("compute.googleapis.com");
    guest_log(format!("DNS: compute.googleapis.com -> {}", if compute_ip.is_empty() { "empty" } else { &compute_ip }));
    if compute_ip.is_empty() || compute_ip == "0.0.0.0" {
        guest_log("ERROR: DNS allowlist failed: compute.googleapis.com resolved to empty.");
        return 1;
    }

    let blocked_ip = resolve_ipv4("example.com");
    guest_log(format!("DNS: example.com -> {}", if blocked_ip.is_empty() { "empty" } else { &blocked_ip }));
    if !blocked_ip.is_empty() && blocked_ip != "0.0.0.0" {
        guest_log(format!(
            "ERROR: DNS sinkhole failed: example.com resolved to '{blocked_ip}' (expected 0.0.0.0/empty)."
        ));
        return 1;
    }

    let proxy_code = curl_code(proxy, timeout_s, Some(proxy)).await;
    guest_log(format!("Proxy: {proxy} -> HTTP {proxy_code}"));
    if proxy_code == "000" {
        guest_log(format!("ERROR: Proxy not reachable at {proxy}."));
        return 1;
    }

    let host_url = format!("http://{}/", args.dns_ip);
    let host_http_code = curl_code(&host_url, timeout_s, None).await;
    guest_log(format!("Host HTTP (expected blocked): {}:80 -> HTTP {host_http_code}", args.dns_ip));
    if host_http_code != "000" {
        guest_log(format!(
            "ERROR: Host HTTP unexpectedly reachable at {}:80 (HTTP {host_http_code}).",
            args.dns_ip
        ));
        return 1;
    }

    let direct_code = curl_code("https://www.googleapis.com/discovery/v1/apis", timeout_s, None).await;
    guest_log(format!("Direct egress (expected blocked): googleapis -> HTTP {direct_code}"));
    if direct_code == "200" {
        guest_log("ERROR: Direct egress unexpectedly succeeded without proxy (HTTP 200).");
        return 1;
    }

    let allowed_code = curl_code("https://www.googleapis.com/discovery/v1/apis", timeout_s, Some(proxy)).await;
    guest_log(format!("Proxy allowlist: googleapis -> HTTP {allowed_code}"));
    if allowed_code != "200" {
        guest_log(format!("ERROR: Allowed googleapis traffic via proxy failed (HTTP {allowed_code})."));
        return 1;
    }

    let compute_code = curl_code("https://compute.googleapis.com/", timeout_s, Some(proxy)).await;
    guest_log(format!("Proxy allowlist: compute.googleapis.com -> HTTP {compute_code} (expected not 000)"));
    if compute_code == "000" {
        guest_log("ERROR: compute.googleapis.com not reachable via proxy (HTTP 000).");
        return 1;
    }

    let blocked_code = curl_code("http://example.com", timeout_s, Some(proxy)).await;
    guest_log(format!("Proxy denylist: example.com -> HTTP {blocked_code} (expected not 200)"));
    if blocked_code == "200" {
        guest_log("ERROR: Blocked domain unexpectedly reachable via proxy (HTTP 200).");
        return 1;
    }

    let blocked_https_code = curl_code("https://example.com", timeout_s, Some(proxy)).await;
    guest_log(format!("Proxy denylist: https example.com -> HTTP {blocked_https_code} (expected not 200)"));
    if blocked_https_code == "200" {
        guest_log("ERROR: Blocked HTTPS domain unexpectedly reachable via proxy (HTTP 200).");
        return 1;
    }

    let metadata_direct = curl_code("http://169.254.169.254/latest/meta-data", 2, None).await;
    if metadata_direct != "000" {
        guest_log("ERROR: Metadata endpoint returned an HTTP response without proxy; sandbox egress policy is broken.");
        return 1;
    }

    let meta_proxy_code = curl_code("http://169.254.169.254/latest/meta-data", timeout_s, Some(proxy)).await;
    guest_log(format!("Proxy denylist: metadata -> HTTP {meta_proxy_code} (expected not 200)"));
    if meta_proxy_code == "200" {
        guest_log("ERROR: Metadata endpoint returned HTTP 200 via proxy; proxy egress guard is broken.");
        return 1;
    }

    0
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = run_checks(&args).await;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_ipv4_returns_empty_for_unresolvable_host() {
        let ip = resolve_ipv4("this-host-does-not-exist.invalid");
        assert!(ip.is_empty());
    }
}
