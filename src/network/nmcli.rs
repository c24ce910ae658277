use log::debug;
use std::fs;
use tokio::process::Command;

use crate::network::{LinkDriver, LinkError, WifiNetwork};

/// [`LinkDriver`] backed by NetworkManager
pub struct NmcliDriver {
    interface: String,
}

impl NmcliDriver {
    pub fn new(interface: &str) -> Self {
        return NmcliDriver { interface: interface.to_string() };
    }

    async fn nmcli(&self, args: &[&str]) -> Result<String, LinkError> {
        debug!("nmcli {}", args.join(" "));
        let output = Command::new("nmcli").args(args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LinkError::Command(stderr.trim().to_string()));
        }
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }
}

/// `nmcli -t -f DEVICE,STATE device status` prints `wlan0:connected`
fn interface_connected(status: &str, interface: &str) -> bool {
    status.lines().any(|line| {
        let mut parts = line.splitn(2, ':');
        parts.next() == Some(interface) && parts.next() == Some("connected")
    })
}

/// Terse `SSID,SIGNAL,SECURITY` rows, colons inside the SSID come escaped as `\:`.
/// Hidden networks are skipped and every SSID is listed once with its best signal.
fn parse_scan(text: &str) -> Vec<WifiNetwork> {
    let mut networks: Vec<WifiNetwork> = Vec::new();
    for line in text.lines() {
        let mut fields = line.rsplitn(3, ':');
        let (security, signal, ssid) = match (fields.next(), fields.next(), fields.next()) {
            (Some(security), Some(signal), Some(ssid)) => (security, signal, ssid),
            _ => continue,
        };
        let ssid = ssid.replace("\\:", ":").replace("\\\\", "\\");
        let signal = match signal.parse::<i32>() {
            Ok(s) => s.clamp(0, 100),
            Err(_) => continue,
        };
        if ssid.is_empty() {
            continue;
        }

        /* NetworkManager derives the percentage linearly from -100..-50 dBm */
        let network = WifiNetwork { ssid, rssi: signal / 2 - 100, secure: !security.is_empty() && security != "--" };
        match networks.iter_mut().find(|n| n.ssid == network.ssid) {
            Some(known) if known.rssi < network.rssi => *known = network,
            Some(_) => {}
            None => networks.push(network),
        }
    }
    networks.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    return networks;
}

fn parse_hardware_address(text: &str) -> Result<[u8; 6], LinkError> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.len() != 6 {
        return Err(LinkError::HardwareAddress(text.trim().to_string()));
    }
    for (i, p) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(p, 16).map_err(|_| LinkError::HardwareAddress(text.trim().to_string()))?;
    }
    return Ok(mac);
}

impl LinkDriver for NmcliDriver {
    async fn connect(&mut self, ssid: &str, pass: &str) -> Result<(), LinkError> {
        let mut args = vec!["-w", "0", "device", "wifi", "connect", ssid];
        if !pass.is_empty() {
            args.extend(["password", pass]);
        }
        args.extend(["ifname", self.interface.as_str()]);
        self.nmcli(&args).await?;
        return Ok(());
    }

    async fn is_connected(&mut self) -> bool {
        match self.nmcli(&["-t", "-f", "DEVICE,STATE", "device", "status"]).await {
            Ok(status) => interface_connected(&status, &self.interface),
            Err(e) => {
                debug!("Unable to query link state: {e}");
                false
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), LinkError> {
        self.nmcli(&["-w", "0", "device", "connect", self.interface.as_str()]).await?;
        return Ok(());
    }

    async fn start_hotspot(&mut self, ssid: &str, pass: &str) -> Result<(), LinkError> {
        self.nmcli(&["device", "wifi", "hotspot", "ifname", self.interface.as_str(), "ssid", ssid, "password", pass]).await?;
        return Ok(());
    }

    fn hardware_address(&self) -> Result<[u8; 6], LinkError> {
        let path = format!("/sys/class/net/{}/address", self.interface);
        let text = fs::read_to_string(&path).map_err(|e| LinkError::HardwareAddress(format!("{path}: {e}")))?;
        parse_hardware_address(&text)
    }

    async fn scan(&mut self) -> Result<Vec<WifiNetwork>, LinkError> {
        let args = ["-t", "-f", "SSID,SIGNAL,SECURITY", "device", "wifi", "list", "ifname", self.interface.as_str()];
        let text = self.nmcli(&args).await?;
        return Ok(parse_scan(&text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_connected() {
        let status = "eth0:unavailable\nwlan0:connected\nlo:unmanaged\n";
        assert!(interface_connected(status, "wlan0"));
        assert!(!interface_connected(status, "eth0"));
        assert!(!interface_connected("wlan0:disconnected\n", "wlan0"));
        assert!(!interface_connected("wlan0:connected (externally)\n", "wlan0"));
    }

    #[test]
    fn test_parse_hardware_address() {
        assert_eq!(parse_hardware_address("24:6f:28:aa:bb:cc\n").unwrap(), [0x24, 0x6F, 0x28, 0xAA, 0xBB, 0xCC]);
        assert!(parse_hardware_address("24:6f:28").is_err());
        assert!(parse_hardware_address("zz:6f:28:aa:bb:cc").is_err());
    }

    #[test]
    fn test_parse_scan() {
        let text = "home:80:WPA2\ncafe\\:guest:40:\n:90:WPA2\nhome:60:WPA2\nlab:100:WPA1 WPA2\nbroken line\n";
        let networks = parse_scan(text);

        assert_eq!(networks, vec![
            WifiNetwork { ssid: "lab".to_string(), rssi: -50, secure: true },
            WifiNetwork { ssid: "home".to_string(), rssi: -60, secure: true },
            WifiNetwork { ssid: "cafe:guest".to_string(), rssi: -80, secure: false },
        ]);
    }
}
