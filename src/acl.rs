use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    pub address: IpAddr,
    pub prefix: Option<u8>,
    pub negated: bool,
}

impl AclEntry {
    pub fn parse(address: &str, prefix: Option<u8>, negated: bool) -> Option<AclEntry> {
        let address: IpAddr = address.trim().parse().ok()?;
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if matches!(prefix, Some(p) if p > max) {
            return None;
        }
        Some(AclEntry {
            address,
            prefix,
            negated,
        })
    }

    /// Parses `"10.0.0.0/8"`, `"!10.0.0.1"` and plain addresses.
    pub fn parse_text(text: &str) -> Option<AclEntry> {
        let text = text.trim();
        let (negated, text) = match text.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let text = text.trim_matches('"');
        match text.split_once('/') {
            Some((address, prefix)) => {
                let prefix = prefix.trim_matches('"').parse::<u8>().ok()?;
                AclEntry::parse(address.trim_matches('"'), Some(prefix), negated)
            }
            None => AclEntry::parse(text, None, negated),
        }
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = u32::from(net);
                let ip = u32::from(*ip);
                let prefix = u32::from(self.prefix.unwrap_or(32));
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                bits & mask == ip & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = u128::from(net);
                let ip = u128::from(*ip);
                let prefix = u32::from(self.prefix.unwrap_or(128));
                let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
                bits & mask == ip & mask
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    pub name: String,
    pub entries: Vec<AclEntry>,
}

impl Acl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// The first entry that covers `ip` decides; negated entries exclude.
    pub fn contains(&self, ip: &str) -> bool {
        let ip: IpAddr = match ip.trim().parse() {
            Ok(ip) => ip,
            Err(_) => return false,
        };
        self.entries
            .iter()
            .find(|entry| entry.matches(&ip))
            .map(|entry| !entry.negated)
            .unwrap_or(false)
    }

    pub fn add(&mut self, entry: AclEntry) {
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    pub fn remove(&mut self, entry: &AclEntry) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.address != entry.address || e.prefix != entry.prefix);
        self.entries.len() != before
    }
}
