//! 网络类型分类
//!
//! 主制式编码沿用手机侧常见的 radio technology 编号，
//! 覆盖类型（override）来自运营商显示信息，非 `None` 时优先。

/// 主制式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioTechnology {
    Unknown,
    Gprs,
    Edge,
    Umts,
    Cdma,
    Evdo0,
    EvdoA,
    OneXRtt,
    Hsdpa,
    Hsupa,
    Hspa,
    Iden,
    EvdoB,
    Lte,
    Ehrpd,
    Hspap,
    Gsm,
    TdScdma,
    Iwlan,
    LteCa,
    Nr,
}

impl RadioTechnology {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Gprs,
            2 => Self::Edge,
            3 => Self::Umts,
            4 => Self::Cdma,
            5 => Self::Evdo0,
            6 => Self::EvdoA,
            7 => Self::OneXRtt,
            8 => Self::Hsdpa,
            9 => Self::Hsupa,
            10 => Self::Hspa,
            11 => Self::Iden,
            12 => Self::EvdoB,
            13 => Self::Lte,
            14 => Self::Ehrpd,
            15 => Self::Hspap,
            16 => Self::Gsm,
            17 => Self::TdScdma,
            18 => Self::Iwlan,
            19 => Self::LteCa,
            20 => Self::Nr,
            _ => Self::Unknown,
        }
    }

    /// 由 ModemManager `AccessTechnologies` 位掩码推导
    ///
    /// 取最高代的制式；LTE 与 5GNR 同时存在视为 NSA，返回 `(Lte, NrNsa)`。
    pub fn from_access_technologies(mask: u32) -> (Self, OverrideNetworkType) {
        use access_tech::*;

        if mask & LTE != 0 && mask & NR5G != 0 {
            return (Self::Lte, OverrideNetworkType::NrNsa);
        }

        let tech = if mask & NR5G != 0 {
            Self::Nr
        } else if mask & LTE != 0 {
            Self::Lte
        } else if mask & HSPA_PLUS != 0 {
            Self::Hspap
        } else if mask & HSPA != 0 {
            Self::Hspa
        } else if mask & HSUPA != 0 {
            Self::Hsupa
        } else if mask & HSDPA != 0 {
            Self::Hsdpa
        } else if mask & EVDOB != 0 {
            Self::EvdoB
        } else if mask & EVDOA != 0 {
            Self::EvdoA
        } else if mask & EVDO0 != 0 {
            Self::Evdo0
        } else if mask & ONE_X_RTT != 0 {
            Self::OneXRtt
        } else if mask & UMTS != 0 {
            Self::Umts
        } else if mask & EDGE != 0 {
            Self::Edge
        } else if mask & GPRS != 0 {
            Self::Gprs
        } else if mask & (GSM | GSM_COMPACT) != 0 {
            Self::Gsm
        } else {
            Self::Unknown
        };

        (tech, OverrideNetworkType::None)
    }
}

/// ModemManager `MMModemAccessTechnology` 位
mod access_tech {
    pub const GSM: u32 = 1 << 1;
    pub const GSM_COMPACT: u32 = 1 << 2;
    pub const GPRS: u32 = 1 << 3;
    pub const EDGE: u32 = 1 << 4;
    pub const UMTS: u32 = 1 << 5;
    pub const HSDPA: u32 = 1 << 6;
    pub const HSUPA: u32 = 1 << 7;
    pub const HSPA: u32 = 1 << 8;
    pub const HSPA_PLUS: u32 = 1 << 9;
    pub const ONE_X_RTT: u32 = 1 << 10;
    pub const EVDO0: u32 = 1 << 11;
    pub const EVDOA: u32 = 1 << 12;
    pub const EVDOB: u32 = 1 << 13;
    pub const LTE: u32 = 1 << 14;
    pub const NR5G: u32 = 1 << 15;
}

/// 覆盖显示类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideNetworkType {
    #[default]
    None,
    LteCa,
    LteAdvancedPro,
    NrNsa,
    NrNsaMmwave,
    NrAdvanced,
}

impl OverrideNetworkType {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::LteCa,
            2 => Self::LteAdvancedPro,
            3 => Self::NrNsa,
            4 => Self::NrNsaMmwave,
            5 => Self::NrAdvanced,
            _ => Self::None,
        }
    }
}

/// 网络类型分类：`GPRS, E, 3G, 4G, 5Ge, 5G, 5G+`，未知为 `""`
pub fn network_category(tech: RadioTechnology, override_type: OverrideNetworkType) -> &'static str {
    match override_type {
        OverrideNetworkType::LteCa | OverrideNetworkType::LteAdvancedPro => return "5Ge",
        OverrideNetworkType::NrNsa => return "5G",
        OverrideNetworkType::NrNsaMmwave | OverrideNetworkType::NrAdvanced => return "5G+",
        OverrideNetworkType::None => {}
    }

    use RadioTechnology::*;
    match tech {
        Gprs => "GPRS",
        Edge => "E",
        Umts | Cdma | Evdo0 | EvdoA | OneXRtt | Hsdpa | Hsupa | Hspa | Iden | EvdoB | Ehrpd
        | Hspap | Gsm | TdScdma => "3G",
        Lte | Iwlan | LteCa => "4G",
        Nr => "5G",
        Unknown => "",
    }
}
