// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Fabric clock synthesis.
//!
//! The fabric PLL multiplies the reference clock into a VCO band and
//! divides back down:
//!
//! ```text
//! vco  = refclk * 4 * fbdiv255 * (1 + fbdiv4) / refdiv      (8-12 GHz)
//! freq = vco / (2 * outdiv)
//! ```
//!
//! The search walks the divider space in a fixed order and keeps the
//! smallest frequency at or above the request (never below), stopping
//! immediately on an exact match.  All comparisons are exact integer
//! cross-multiplications, so repeated runs with the same inputs return
//! identical divider sets.  If no combination lands in the VCO band at or
//! above the request, the search fails rather than programming an
//! out-of-spec clock.

use chip::SkuRestriction;

use crate::types::LcpdError;
use crate::types::LcpdResult;

/// Valid VCO band, inclusive.
pub const VCO_MIN_HZ: u64 = 8_000_000_000;
pub const VCO_MAX_HZ: u64 = 12_000_000_000;

const OUT_DIV_MIN: u8 = 2;
const OUT_DIV_MAX: u8 = 63;
const REF_DIV_MIN: u8 = 1;
const REF_DIV_MAX: u8 = 63;
const FB_DIV255_MAX: u16 = 255;

/// One point in the divider space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PllDividers {
    pub refdiv: u8,
    pub outdiv: u8,
    pub fbdiv4: u8,
    pub fbdiv255: u8,
}

/// The divider set the search selected and the frequency it synthesizes
/// (rounded down to whole Hz for reporting; selection itself is exact).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockChoice {
    pub dividers: PllDividers,
    pub freq_hz: u64,
}

/// Apply a feature-restriction code to a requested frequency: restricted
/// parts run only at one of a short list of frequencies, and the request
/// is clamped to the nearest permitted value at or below it.  A request
/// below the entire menu gets the lowest permitted frequency.
pub fn clamp_to_restriction(
    request_hz: u64,
    restriction: SkuRestriction,
) -> u64 {
    match restriction {
        SkuRestriction::FullControl => request_hz,
        SkuRestriction::Limited(menu) => menu
            .iter()
            .copied()
            .filter(|f| *f <= request_hz)
            .max()
            .unwrap_or_else(|| {
                menu.iter().copied().min().expect("menus are never empty")
            }),
    }
}

/// Search the divider space for the smallest achievable frequency at or
/// above `request_hz`, honoring the part's feature restriction.
pub fn select_fabric_clock(
    refclk_hz: u64,
    request_hz: u64,
    restriction: SkuRestriction,
) -> LcpdResult<ClockChoice> {
    if refclk_hz == 0 {
        return Err(LcpdError::Invalid("zero reference clock".to_string()));
    }
    let target = clamp_to_restriction(request_hz, restriction);

    // freq = refclk * 4 * n / (2 * refdiv * outdiv), with n the effective
    // feedback count fbdiv255 * (1 + fbdiv4).  Candidates are compared as
    // exact rationals: numerator refclk * 4 * n against denominator
    // 2 * refdiv * outdiv.
    let mut best: Option<(u128, u128, PllDividers)> = None;

    for outdiv in OUT_DIV_MIN..=OUT_DIV_MAX {
        for refdiv in REF_DIV_MIN..=REF_DIV_MAX {
            for fbdiv4 in 0u8..=1 {
                let step = refclk_hz as u128 * 4 * (1 + fbdiv4 as u128);
                // Only feedback counts landing the VCO inside the band
                // are worth visiting.
                let vco_min = VCO_MIN_HZ as u128 * refdiv as u128;
                let vco_max = VCO_MAX_HZ as u128 * refdiv as u128;
                let m_min = vco_min.div_ceil(step).max(1);
                let m_max = (vco_max / step).min(FB_DIV255_MAX as u128);
                for m in m_min..=m_max {
                    let num = step * m;
                    let den = 2 * refdiv as u128 * outdiv as u128;
                    if num < target as u128 * den {
                        continue;
                    }
                    let dividers = PllDividers {
                        refdiv,
                        outdiv,
                        fbdiv4,
                        fbdiv255: m as u8,
                    };
                    if num == target as u128 * den {
                        return Ok(ClockChoice {
                            dividers,
                            freq_hz: target,
                        });
                    }
                    let better = match &best {
                        None => true,
                        Some((bnum, bden, _)) => num * bden < bnum * den,
                    };
                    if better {
                        best = Some((num, den, dividers));
                    }
                }
            }
        }
    }

    best.map(|(num, den, dividers)| ClockChoice {
        dividers,
        freq_hz: (num / den) as u64,
    })
    .ok_or(LcpdError::ClockUnachievable(target))
}

/// The exact VCO a divider set synthesizes, for band verification.
pub fn vco_hz(refclk_hz: u64, dividers: &PllDividers) -> u64 {
    let n = dividers.fbdiv255 as u128 * (1 + dividers.fbdiv4 as u128);
    (refclk_hz as u128 * 4 * n / dividers.refdiv as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    // The Kestrel reference clock.
    const REFCLK: u64 = 644_531_250;

    #[test]
    fn full_control_700_mhz_nearest_above() {
        let choice =
            select_fabric_clock(REFCLK, 700_000_000, SkuRestriction::FullControl)
                .unwrap();
        assert!(choice.freq_hz >= 700_000_000);
        // The closest achievable frequency above 700 MHz with these
        // divider ranges is 700.094 MHz, first reached at outdiv 6.
        assert_eq!(
            choice.dividers,
            PllDividers {
                refdiv: 58,
                outdiv: 6,
                fbdiv4: 0,
                fbdiv255: 189,
            }
        );
        assert_eq!(choice.freq_hz, 700_094_288);

        let vco = vco_hz(REFCLK, &choice.dividers);
        assert!((VCO_MIN_HZ..=VCO_MAX_HZ).contains(&vco));
    }

    #[test]
    fn search_is_deterministic() {
        for request in [137_000_000, 700_000_000, 1_250_000_000] {
            let a = select_fabric_clock(
                REFCLK,
                request,
                SkuRestriction::FullControl,
            )
            .unwrap();
            let b = select_fabric_clock(
                REFCLK,
                request,
                SkuRestriction::FullControl,
            )
            .unwrap();
            assert_eq!(a, b);
            assert!(a.freq_hz >= request);
        }
    }

    #[test]
    fn exact_match_early_exit() {
        // 2578.125 MHz falls straight out of the first in-band feedback
        // count: vco = refclk * 4 * 4 = 10.3125 GHz, outdiv 2.
        let request = 2_578_125_000;
        let choice =
            select_fabric_clock(REFCLK, request, SkuRestriction::FullControl)
                .unwrap();
        assert_eq!(choice.freq_hz, request);
        assert_eq!(
            choice.dividers,
            PllDividers { refdiv: 1, outdiv: 2, fbdiv4: 0, fbdiv255: 4 }
        );
    }

    #[test]
    fn restricted_sku_clamps_and_hits_exactly() {
        const MENU: &[u64] =
            &[300_000_000, 400_000_000, 500_000_000, 600_000_000];
        let choice = select_fabric_clock(
            REFCLK,
            700_000_000,
            SkuRestriction::Limited(MENU),
        )
        .unwrap();
        // 700 clamps down to 600, which the dividers synthesize exactly.
        assert_eq!(choice.freq_hz, 600_000_000);
        assert_eq!(
            choice.dividers,
            PllDividers { refdiv: 55, outdiv: 10, fbdiv4: 1, fbdiv255: 128 }
        );
        assert_eq!(vco_hz(REFCLK, &choice.dividers), VCO_MAX_HZ);
    }

    #[test]
    fn clamp_below_menu_takes_lowest() {
        const MENU: &[u64] = &[300_000_000, 400_000_000];
        assert_eq!(
            clamp_to_restriction(250_000_000, SkuRestriction::Limited(MENU)),
            300_000_000
        );
        assert_eq!(
            clamp_to_restriction(350_000_000, SkuRestriction::Limited(MENU)),
            300_000_000
        );
        assert_eq!(
            clamp_to_restriction(
                999_000_000,
                SkuRestriction::FullControl
            ),
            999_000_000
        );
    }

    #[test]
    fn unachievable_request_fails_distinctly() {
        // Above vco_max / (2 * outdiv_min) nothing is representable.
        match select_fabric_clock(
            REFCLK,
            4_000_000_000,
            SkuRestriction::FullControl,
        ) {
            Err(LcpdError::ClockUnachievable(f)) => {
                assert_eq!(f, 4_000_000_000)
            }
            x => panic!("expected ClockUnachievable, got {x:?}"),
        }
    }

    #[test]
    fn reported_frequency_matches_dividers() {
        let choice =
            select_fabric_clock(REFCLK, 450_000_000, SkuRestriction::FullControl)
                .unwrap();
        let d = &choice.dividers;
        let n = d.fbdiv255 as u128 * (1 + d.fbdiv4 as u128);
        let num = REFCLK as u128 * 4 * n;
        let den = 2 * d.refdiv as u128 * d.outdiv as u128;
        assert_eq!(choice.freq_hz, (num / den) as u64);
        assert!(num >= 450_000_000 * den);
    }
}
