use serde_json::{json, Value};

/// Shell command that trusts the root certificate on the given platform.
pub fn install_script(os: &str, cert_path: &str) -> String {
    match os {
        "darwin" => format!(
            "sudo security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain {}",
            cert_path
        ),
        "windows" => format!("certutil -addstore -f ROOT {}", cert_path),
        "linux" => format!(
            "sudo cp {} /usr/local/share/ca-certificates/cetiprobe-ca.crt && sudo update-ca-certificates",
            cert_path
        ),
        _ => String::new(),
    }
}

/// Manual installation walkthrough per platform. Unknown platforms fall
/// back to the macOS steps.
pub fn install_instructions(os: &str) -> Value {
    match os {
        "windows" => json!({
            "title": "Windows manual installation",
            "steps": [
                "1. Right-click the downloaded certificate file and choose \"Install Certificate\"",
                "2. Select \"Local Machine\" and continue",
                "3. Choose \"Place all certificates in the following store\"",
                "4. Browse to \"Trusted Root Certification Authorities\"",
                "5. Finish and accept the security warning",
            ],
            "command": "certutil -addstore -f ROOT proxy_root_ca.pem",
        }),
        "linux" => json!({
            "title": "Linux manual installation",
            "steps": [
                "Debian/Ubuntu:",
                "  sudo cp proxy_root_ca.pem /usr/local/share/ca-certificates/cetiprobe-ca.crt",
                "  sudo update-ca-certificates",
                "",
                "RHEL/CentOS:",
                "  sudo cp proxy_root_ca.pem /etc/pki/ca-trust/source/anchors/cetiprobe-ca.crt",
                "  sudo update-ca-trust",
            ],
            "command": "",
        }),
        _ => json!({
            "title": "macOS manual installation",
            "steps": [
                "Preferred:",
                "1. Double-click the downloaded proxy_root_ca.pem file",
                "2. In Keychain Access pick the \"login\" keychain",
                "3. Open the CetiProbe Root CA entry",
                "4. Expand \"Trust\" and set \"When using this certificate\" to \"Always Trust\"",
                "5. Close the window and confirm with your password",
                "",
                "Fallback:",
                "1. Run the command below in a terminal",
                "2. Enter the administrator password",
                "3. Restart the browser",
            ],
            "command": "sudo security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain proxy_root_ca.pem",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_reference_the_certificate_path() {
        for os in ["darwin", "windows", "linux"] {
            let script = install_script(os, "certs/proxy_root_ca.pem");
            assert!(script.contains("certs/proxy_root_ca.pem"), "{}", os);
        }
        assert!(install_script("plan9", "x").is_empty());
    }

    #[test]
    fn unknown_platform_falls_back_to_darwin_steps() {
        let fallback = install_instructions("beos");
        assert_eq!(fallback["title"], install_instructions("darwin")["title"]);
    }
}
