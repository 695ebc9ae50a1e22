//! Scheduling network upgrades on regtest.

/// Upgrades whose activation height regtest lets a node override.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkUpgrade {
    Overwinter,
    Sapling,
    Blossom,
    Heartwood,
    Canopy,
    Nu5,
    Nu6,
}

impl NetworkUpgrade {
    /// The consensus branch id that names this upgrade.
    pub fn branch_id(&self) -> u32 {
        match self {
            NetworkUpgrade::Overwinter => 0x5ba8_1b19,
            NetworkUpgrade::Sapling => 0x76b8_09bb,
            NetworkUpgrade::Blossom => 0x2bb4_0e60,
            NetworkUpgrade::Heartwood => 0xf5b9_230b,
            NetworkUpgrade::Canopy => 0xe9ff_75a6,
            NetworkUpgrade::Nu5 => 0xc2d6_d0b4,
            NetworkUpgrade::Nu6 => 0xc8e7_1055,
        }
    }
}

/// The node argument activating `upgrade` at `height`.
pub fn nuparams(upgrade: NetworkUpgrade, height: u32) -> String {
    format!("-nuparams={:08x}:{height}", upgrade.branch_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(NetworkUpgrade::Overwinter, 1 => "-nuparams=5ba81b19:1")]
    #[test_case(NetworkUpgrade::Blossom, 205 => "-nuparams=2bb40e60:205")]
    #[test_case(NetworkUpgrade::Heartwood, 205 => "-nuparams=f5b9230b:205")]
    #[test_case(NetworkUpgrade::Canopy, 205 => "-nuparams=e9ff75a6:205")]
    #[test_case(NetworkUpgrade::Nu5, 210 => "-nuparams=c2d6d0b4:210")]
    fn argument_is_hex_branch_id_and_height(upgrade: NetworkUpgrade, height: u32) -> String {
        nuparams(upgrade, height)
    }
}
