// Transport endpoint strings: `tcp://host:port` or bare `host:port`.

/// Strip the optional `tcp://` scheme and check that a port is present.
/// Returns the `host:port` part suitable for `TcpListener::bind`.
pub fn parse_endpoint(endpoint: &str) -> Result<String, String> {
    let rest = match endpoint.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => return Err(format!("unsupported scheme '{scheme}' in '{endpoint}'")),
        None => endpoint,
    };

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| format!("missing port in '{endpoint}'"))?;
    if host.is_empty() {
        return Err(format!("missing host in '{endpoint}'"));
    }
    port.parse::<u16>()
        .map_err(|_| format!("invalid port '{port}' in '{endpoint}'"))?;

    Ok(rest.to_string())
}
