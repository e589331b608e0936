/*!
JSON payloads in the shape the Proxmox API returns inside `{"data": ...}`.
*/

use serde_json::{json, Value};

pub fn node(name: &str, online: bool) -> Value {
    json!({
        "node": name,
        "status": if online { "online" } else { "offline" },
        "type": "node",
    })
}

pub fn node_status(cpu: f64, total: u64, used: u64, free: u64, uptime: u64) -> Value {
    json!({
        "cpu": cpu,
        "memory": { "total": total, "used": used, "free": free },
        "uptime": uptime,
    })
}

pub fn storage(name: &str, backend: &str, total: u64, used: u64, avail: u64) -> Value {
    json!({
        "storage": name,
        "type": backend,
        "total": total,
        "used": used,
        "avail": avail,
        "active": 1,
    })
}

/// Guest list entry; `status` is `running` or `stopped`.
pub fn guest(vmid: u32, name: Option<&str>, status: &str) -> Value {
    let mut entry = json!({ "vmid": vmid, "status": status });
    if let Some(name) = name {
        entry["name"] = json!(name);
    }
    entry
}

pub fn guest_status(cpu: f64, mem: u64, maxmem: u64, netin: Value, netout: Value) -> Value {
    json!({
        "status": "running",
        "cpu": cpu,
        "mem": mem,
        "maxmem": maxmem,
        "uptime": 3600,
        "diskread": 1024,
        "diskwrite": 2048,
        "netin": netin,
        "netout": netout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_name_is_optional() {
        assert_eq!(guest(101, None, "stopped").get("name"), None);
        assert_eq!(guest(101, Some("web"), "running")["name"], "web");
    }
}
