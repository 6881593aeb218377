use base64::Engine;

/// Builds the cloud-config body (not yet base64-encoded) so tests can
/// decode-and-assert on its content per the cloud-init-correctness property.
pub fn build_user_data_plain(password: &str, startup_script: Option<&str>) -> String {
    let mut runcmd = vec![
        r#"sed -i 's/^#\?PasswordAuthentication.*/PasswordAuthentication yes/' /etc/ssh/sshd_config"#.to_string(),
        r#"sed -i 's/^#\?PasswordAuthentication.*/PasswordAuthentication yes/' /etc/ssh/sshd_config.d/60-cloudimg-settings.conf"#.to_string(),
        r#"sed -i 's/^#\?PermitRootLogin.*/PermitRootLogin prohibit-password/' /etc/ssh/sshd_config"#.to_string(),
        "while fuser /var/lib/apt/lists/lock >/dev/null 2>&1 || fuser /var/lib/dpkg/lock >/dev/null 2>&1; do sleep 10; done".to_string(),
        "for i in 1 2 3; do apt-get update -y && apt-get install -y curl wget unzip git socat cron && break; sleep 15; done".to_string(),
    ];
    if let Some(script) = startup_script {
        runcmd.push(script.to_string());
    }
    runcmd.push(
        "systemctl restart sshd || service sshd restart || service ssh restart".to_string(),
    );

    let runcmd_yaml = runcmd
        .iter()
        .map(|line| format!("  - {}", yaml_quote(line)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "#cloud-config\nchpasswd:\n  list: |\n    ubuntu:{password}\n  expire: false\nruncmd:\n{runcmd_yaml}\n"
    )
}

/// Base64 encodes the cloud-config, ready to hand to `LaunchInstanceDetails`
/// as the instance's user-data.
pub fn build_user_data_base64(password: &str, startup_script: Option<&str>) -> String {
    let plain = build_user_data_plain(password, startup_script);
    base64::engine::general_purpose::STANDARD.encode(plain)
}

fn yaml_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patches_both_sshd_config_files() {
        let plain = build_user_data_plain("hunter2", None);
        assert!(plain.contains(" /etc/ssh/sshd_config\""));
        assert!(plain.contains("/etc/ssh/sshd_config.d/60-cloudimg-settings.conf"));
        let occurrences = plain.matches("PasswordAuthentication yes").count();
        assert_eq!(occurrences, 2);
    }

    #[test]
    fn sets_ubuntu_password() {
        let plain = build_user_data_plain("hunter2", None);
        assert!(plain.contains("ubuntu:hunter2"));
    }

    #[test]
    fn keeps_root_key_only() {
        let plain = build_user_data_plain("hunter2", None);
        assert!(plain.contains("PermitRootLogin prohibit-password"));
    }

    #[test]
    fn restarts_sshd() {
        let plain = build_user_data_plain("hunter2", None);
        assert!(plain.contains("restart sshd"));
    }

    #[test]
    fn appends_startup_script_after_install_block() {
        let plain = build_user_data_plain("hunter2", Some("touch /tmp/marker"));
        let install_pos = plain.find("apt-get install").unwrap();
        let script_pos = plain.find("touch /tmp/marker").unwrap();
        let restart_pos = plain.find("restart sshd").unwrap();
        assert!(install_pos < script_pos);
        assert!(script_pos < restart_pos);
    }

    #[test]
    fn base64_decodes_back_to_plain() {
        let encoded = build_user_data_base64("hunter2", None);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let decoded = String::from_utf8(decoded).unwrap();
        assert_eq!(decoded, build_user_data_plain("hunter2", None));
    }
}
