//! Pure aggregation and scoring over award records. Nothing here performs I/O
//! or holds shared state; identical inputs always produce identical outputs.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Datelike, NaiveDate};
use govlead_core::{
    parse_award_date, AgencySpend, AggregatedCompany, CodeCount, CompetitionCounts, Contact,
    EnrichedCompany, Lead, Location, RawAward, RelationshipStrength, SalesIntelligence,
    SpecialPrograms, SpendingTrend,
};
use tracing::debug;

pub const CRATE_NAME: &str = "govlead-engine";

pub const TOP_AGENCIES: usize = 10;
pub const TOP_CLASSIFICATIONS: usize = 5;

/// Records with a non-blank UEI group by it; the rest group by recipient name.
pub fn group_key(award: &RawAward) -> String {
    award
        .recipient_uei
        .as_deref()
        .map(str::trim)
        .filter(|uei| !uei.is_empty())
        .unwrap_or_else(|| award.recipient_name.trim())
        .to_string()
}

/// Rolls awards up into one profile per recipient, ordered by total awards
/// descending (ties by group key).
pub fn aggregate_awards(awards: &[RawAward], today: NaiveDate) -> Vec<AggregatedCompany> {
    let mut groups: BTreeMap<String, Vec<&RawAward>> = BTreeMap::new();
    for award in awards {
        groups.entry(group_key(award)).or_default().push(award);
    }
    debug!(records = awards.len(), companies = groups.len(), "grouped awards");

    let mut companies = groups
        .into_iter()
        .map(|(key, records)| aggregate_group(key, &records, today))
        .collect::<Vec<_>>();
    companies.sort_by(|a, b| {
        b.total_awards
            .partial_cmp(&a.total_awards)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.group_key.cmp(&b.group_key))
    });
    companies
}

#[derive(Default)]
struct CodeTally {
    description: Option<String>,
    count: usize,
}

fn aggregate_group(key: String, records: &[&RawAward], today: NaiveDate) -> AggregatedCompany {
    let first_non_empty = |pick: fn(&RawAward) -> Option<&str>| {
        records
            .iter()
            .find_map(|r| pick(r).map(str::trim).filter(|v| !v.is_empty()))
            .map(ToString::to_string)
    };

    let name = first_non_empty(|r| Some(r.recipient_name.as_str())).unwrap_or_else(|| key.clone());
    let uei = first_non_empty(|r| r.recipient_uei.as_deref());
    let secondary_id = first_non_empty(|r| r.recipient_duns.as_deref());
    let location = records
        .iter()
        .map(|r| &r.recipient_location)
        .find(|loc| !loc.is_empty())
        .cloned()
        .unwrap_or_else(Location::default);

    let contract_count = records.len();
    let total_awards: f64 = records.iter().map(|r| r.award_amount).sum();
    let total_obligations: f64 = records.iter().map(|r| r.total_obligation).sum();
    let total_outlays: f64 = records.iter().map(|r| r.total_outlays).sum();
    let largest_award = records
        .iter()
        .map(|r| r.award_amount)
        .fold(f64::NEG_INFINITY, f64::max)
        .max(0.0);
    let average_contract_value = if contract_count > 0 {
        total_awards / contract_count as f64
    } else {
        0.0
    };

    let start_dates = records
        .iter()
        .filter_map(|r| r.start_date.as_deref().and_then(parse_award_date))
        .collect::<Vec<_>>();
    let first_contract_date = start_dates.iter().min().copied();
    let last_contract_date = start_dates.iter().max().copied();
    let active_contracts = records
        .iter()
        .filter_map(|r| r.end_date.as_deref().and_then(parse_award_date))
        .filter(|end| *end > today)
        .count();
    let years_in_business = first_contract_date
        .map(|first| (today.year() - first.year()).max(1))
        .unwrap_or(1);

    let mut agencies: HashMap<&str, AgencySpend> = HashMap::new();
    let mut naics: HashMap<&str, CodeTally> = HashMap::new();
    let mut psc: HashMap<&str, CodeTally> = HashMap::new();
    let mut contract_types = BTreeSet::new();
    let mut set_aside_programs = BTreeSet::new();
    let mut performance_states = BTreeSet::new();
    let mut competition = CompetitionCounts::default();
    let mut special_programs = SpecialPrograms::default();

    for record in records {
        if let Some(agency) = non_blank(record.awarding_agency.name.as_deref()) {
            let entry = agencies.entry(agency).or_insert_with(|| AgencySpend {
                name: agency.to_string(),
                code: record.awarding_agency.code.clone(),
                total_spend: 0.0,
                contract_count: 0,
            });
            entry.total_spend += record.award_amount;
            entry.contract_count += 1;
        }
        for (tallies, class) in [(&mut naics, &record.naics), (&mut psc, &record.psc)] {
            if let Some(code) = non_blank(class.code.as_deref()) {
                let tally = tallies.entry(code).or_default();
                tally.count += 1;
                if tally.description.is_none() {
                    tally.description = class.description.clone();
                }
            }
        }
        if let Some(kind) = non_blank(record.contract_type.as_deref()) {
            contract_types.insert(kind.to_string());
        }
        if let Some(set_aside) = non_blank(record.set_aside_type.as_deref()) {
            if !set_aside.to_ascii_uppercase().starts_with("NO SET ASIDE USED") {
                set_aside_programs.insert(set_aside.to_string());
            }
        }
        if let Some(state) = non_blank(record.performance_state.as_deref()) {
            performance_states.insert(state.to_string());
        }
        if let Some(extent) = record.competition_extent.as_deref() {
            tally_competition(&mut competition, extent);
        }
        if record.covid_obligations > 0.0
            || record
                .disaster_emergency_fund_codes
                .iter()
                .any(|code| !code.trim().is_empty())
        {
            special_programs.emergency_funding = true;
        }
        if record.infrastructure_obligations > 0.0 {
            special_programs.infrastructure_funding = true;
        }
    }

    let agency_count = agencies.len();
    let mut top_agencies = agencies.into_values().collect::<Vec<_>>();
    top_agencies.sort_by(|a, b| {
        b.total_spend
            .partial_cmp(&a.total_spend)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    top_agencies.truncate(TOP_AGENCIES);

    let multi_state = performance_states.len() > 1;
    AggregatedCompany {
        group_key: key,
        name,
        uei,
        secondary_id,
        location,
        total_awards,
        total_obligations,
        total_outlays,
        contract_count,
        average_contract_value,
        largest_award,
        first_contract_date,
        last_contract_date,
        active_contracts,
        years_in_business,
        top_agencies,
        agency_count,
        top_naics: top_codes(naics),
        top_psc: top_codes(psc),
        contract_types,
        set_aside_programs,
        competition,
        special_programs,
        performance_states,
        multi_state,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// Case-sensitive; at most one counter per record.
fn tally_competition(counts: &mut CompetitionCounts, extent: &str) {
    if extent.contains("FULL AND OPEN") {
        counts.full_and_open += 1;
    } else if extent.contains("SOLE SOURCE") || extent.contains("NOT COMPETED") {
        counts.sole_source += 1;
    } else if extent.contains("NOT AVAILABLE FOR COMPETITION") {
        counts.limited += 1;
    }
}

fn top_codes(tallies: HashMap<&str, CodeTally>) -> Vec<CodeCount> {
    let mut codes = tallies
        .into_iter()
        .map(|(code, tally)| CodeCount {
            code: code.to_string(),
            description: tally.description,
            contract_count: tally.count,
        })
        .collect::<Vec<_>>();
    codes.sort_by(|a, b| {
        b.contract_count
            .cmp(&a.contract_count)
            .then_with(|| a.code.cmp(&b.code))
    });
    codes.truncate(TOP_CLASSIFICATIONS);
    codes
}

fn format_dollars(amount: f64) -> String {
    if amount >= 1_000_000_000.0 {
        format!("${:.1}B", amount / 1_000_000_000.0)
    } else if amount >= 1_000_000.0 {
        format!("${:.1}M", amount / 1_000_000.0)
    } else if amount >= 1_000.0 {
        format!("${:.1}K", amount / 1_000.0)
    } else {
        format!("${amount:.0}")
    }
}

/// Opportunity score, category labels and insights for one company.
/// `decision_makers` is left empty; see [`assemble_lead`].
pub fn score_company(company: &AggregatedCompany, today: NaiveDate) -> SalesIntelligence {
    let mut score: u32 = 0;
    let mut insights = Vec::new();

    if company.total_awards > 50_000_000.0 {
        score += 30;
        insights.push(format!(
            "Major federal contractor with {} in total awards",
            format_dollars(company.total_awards)
        ));
    } else if company.total_awards > 10_000_000.0 {
        score += 20;
        insights.push(format!(
            "Significant federal contractor with {} in total awards",
            format_dollars(company.total_awards)
        ));
    } else if company.total_awards > 1_000_000.0 {
        score += 10;
    }

    if company.contract_count > 50 {
        score += 15;
        insights.push(format!(
            "High contract volume: {} contracts",
            company.contract_count
        ));
    } else if company.contract_count > 20 {
        score += 10;
    } else if company.contract_count > 5 {
        score += 5;
    }

    if company.agency_count > 5 {
        score += 5;
        insights.push(format!(
            "Works with {} different agencies",
            company.agency_count
        ));
    }

    if let Some(last) = company.last_contract_date {
        let days = (today - last).num_days();
        if days < 180 {
            score += 20;
            insights.push(format!(
                "Recent contract activity ({days} days since last award)"
            ));
        } else if days < 365 {
            score += 15;
        } else if days < 730 {
            score += 10;
        }
    }

    if company.active_contracts > 10 {
        score += 15;
        insights.push(format!(
            "{} active contracts in progress",
            company.active_contracts
        ));
    } else if company.active_contracts > 5 {
        score += 10;
    } else if company.active_contracts > 0 {
        score += 5;
    }

    if company.years_in_business > 10 {
        score += 15;
        insights.push(format!(
            "Established federal contractor ({} years of award history)",
            company.years_in_business
        ));
    } else if company.years_in_business > 5 {
        score += 10;
    } else if company.years_in_business > 2 {
        score += 5;
    }

    if !company.set_aside_programs.is_empty() {
        let programs = company
            .set_aside_programs
            .iter()
            .take(2)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        insights.push(format!("Participates in set-aside programs: {programs}"));
    }

    if company.multi_state {
        insights.push(format!(
            "Performs work across {} states",
            company.performance_states.len()
        ));
    }

    let relationship_strength = classify_relationship(company);
    SalesIntelligence {
        opportunity_score: score.min(100) as u8,
        relationship_strength,
        spending_trend: spending_trend(company),
        insights,
        recommended_approach: recommended_approach(relationship_strength).to_string(),
        decision_makers: Vec::new(),
    }
}

pub fn classify_relationship(company: &AggregatedCompany) -> RelationshipStrength {
    if company.years_in_business < 2 || company.contract_count < 3 {
        RelationshipStrength::New
    } else if company.years_in_business < 5 || company.agency_count < 3 {
        RelationshipStrength::Emerging
    } else if company.years_in_business < 10 || company.total_awards < 20_000_000.0 {
        RelationshipStrength::Established
    } else {
        RelationshipStrength::Strategic
    }
}

/// Binary heuristic: no time series is available, so `Declining` is never
/// produced.
pub fn spending_trend(company: &AggregatedCompany) -> SpendingTrend {
    if company.active_contracts as f64 > 0.3 * company.contract_count as f64 {
        SpendingTrend::Growing
    } else {
        SpendingTrend::Stable
    }
}

pub fn recommended_approach(strength: RelationshipStrength) -> &'static str {
    match strength {
        RelationshipStrength::Strategic => {
            "Executive engagement: position as a strategic partner and pursue teaming on large recompetes."
        }
        RelationshipStrength::Established => {
            "Target agency relationships: lead with offerings aligned to their primary agency customers."
        }
        RelationshipStrength::Emerging => {
            "Value-add relationship building: offer capabilities that help them expand into new agencies."
        }
        RelationshipStrength::New => {
            "Educational approach: share federal market insight and compliance support to build trust."
        }
    }
}

const DECISION_MAKER_KEYWORDS: [&str; 9] = [
    "ceo",
    "cto",
    "cfo",
    "coo",
    "president",
    "vice president",
    "vp",
    "director",
    "chief",
];

/// Case-insensitive substring match against the decision-maker keywords.
pub fn is_decision_maker_title(title: &str) -> bool {
    let lowered = title.to_lowercase();
    DECISION_MAKER_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Flags decision-maker titles in place and returns copies of the flagged
/// contacts in their original order.
pub fn mark_decision_makers(contacts: &mut [Contact]) -> Vec<Contact> {
    contacts
        .iter_mut()
        .filter_map(|contact| {
            contact.is_decision_maker = is_decision_maker_title(&contact.title);
            contact.is_decision_maker.then(|| contact.clone())
        })
        .collect()
}

/// Scores `company` and merges the enrichment data into a finished lead.
pub fn assemble_lead(
    company: AggregatedCompany,
    enriched: EnrichedCompany,
    today: NaiveDate,
) -> Lead {
    let mut intelligence = score_company(&company, today);
    let mut contacts = enriched.contacts;
    intelligence.decision_makers = mark_decision_makers(&mut contacts);
    Lead {
        company,
        intelligence,
        contacts,
        company_info: enriched.company_info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use govlead_core::{AgencyRef, ClassificationCode, ContactSource};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn award(name: &str, uei: Option<&str>, amount: f64) -> RawAward {
        RawAward {
            recipient_name: name.to_string(),
            recipient_uei: uei.map(ToString::to_string),
            award_amount: amount,
            total_obligation: amount,
            ..Default::default()
        }
    }

    fn scenario_a_awards() -> Vec<RawAward> {
        let first = NaiveDate::from_ymd_opt(2023, 1, 15).unwrap();
        (0..20)
            .map(|i| {
                let mut record = award("X1 Holdings", Some("X1"), 3_000_000.0);
                record.start_date = Some((first + Duration::days(57 * i)).to_string());
                record.end_date = Some(if i < 12 { "2027-06-30" } else { "2024-06-30" }.to_string());
                record.awarding_agency = AgencyRef {
                    name: Some(format!("Agency {}", i % 6)),
                    code: None,
                };
                record
            })
            .collect()
    }

    fn base_company() -> AggregatedCompany {
        aggregate_awards(&[award("Base Co", Some("B1"), 100.0)], today()).remove(0)
    }

    #[test]
    fn scenario_a_aggregates_and_scores_exactly() {
        let companies = aggregate_awards(&scenario_a_awards(), today());
        assert_eq!(companies.len(), 1);
        let company = &companies[0];
        assert_eq!(company.group_key, "X1");
        assert_eq!(company.contract_count, 20);
        assert_eq!(company.active_contracts, 12);
        assert_eq!(company.agency_count, 6);
        assert_eq!(company.years_in_business, 3);
        assert!((company.total_awards - 60_000_000.0).abs() < 1e-6);
        assert!((company.average_contract_value - 3_000_000.0).abs() < 1e-6);

        let days = (today() - company.last_contract_date.unwrap()).num_days();
        assert!(days < 180, "last award {days} days ago");

        let intel = score_company(company, today());
        // awards 30 + count 5 + agencies 5 + recency 20 + active 15 + years 5
        assert_eq!(intel.opportunity_score, 80);
        assert_eq!(intel.relationship_strength, RelationshipStrength::Emerging);
        assert_eq!(intel.spending_trend, SpendingTrend::Growing);
        assert_eq!(intel, score_company(company, today()));
        assert!(intel.insights[0].contains("$60.0M"));
    }

    #[test]
    fn grouping_partitions_records_and_preserves_totals() {
        let mut awards = vec![
            award("Acme", Some("A1"), 10.0),
            award("Acme Corp", Some(" A1 "), 5.5),
            award("Cobalt", None, 7.0),
            award("Cobalt", Some("  "), 1.0),
            award("Delta", Some("D1"), 100.0),
        ];
        awards[0].recipient_duns = Some("123".into());

        let companies = aggregate_awards(&awards, today());
        let input_total: f64 = awards.iter().map(|a| a.award_amount).sum();
        let output_total: f64 = companies.iter().map(|c| c.total_awards).sum();
        assert!((input_total - output_total).abs() < 1e-9);
        assert_eq!(
            companies.iter().map(|c| c.contract_count).sum::<usize>(),
            awards.len()
        );

        let keys = companies.iter().map(|c| c.group_key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["D1", "A1", "Cobalt"]);
        assert_eq!(companies[1].name, "Acme");
        assert_eq!(companies[1].secondary_id.as_deref(), Some("123"));
        assert_eq!(companies[2].contract_count, 2);
        assert_eq!(companies[2].uei, None);
        assert!(aggregate_awards(&[], today()).is_empty());
    }

    #[test]
    fn rollups_rank_codes_and_classify_competition() {
        let mut awards = Vec::new();
        for (i, extent) in [
            "FULL AND OPEN COMPETITION",
            "NOT COMPETED UNDER SAP",
            "NOT AVAILABLE FOR COMPETITION",
            "full and open",
            "",
        ]
        .into_iter()
        .enumerate()
        {
            let mut record = award("Acme", Some("A1"), 1_000.0 * (i as f64 + 1.0));
            record.competition_extent = Some(extent.to_string());
            record.naics = ClassificationCode {
                code: Some(if i < 3 { "541512" } else { "541330" }.to_string()),
                description: None,
            };
            record.set_aside_type = Some(
                ["SMALL BUSINESS SET ASIDE", "NO SET ASIDE USED.", "", "8(A)", "WOSB"][i].to_string(),
            );
            record.performance_state = Some(["VA", "MD", "VA", "", "VA"][i].to_string());
            record.start_date = Some("not-a-date".into());
            awards.push(record);
        }
        awards[1].disaster_emergency_fund_codes = vec!["L".into()];

        let company = aggregate_awards(&awards, today()).remove(0);
        assert_eq!(
            company.competition,
            CompetitionCounts {
                full_and_open: 1,
                sole_source: 1,
                limited: 1
            }
        );
        assert_eq!(company.top_naics[0].code, "541512");
        assert_eq!(company.top_naics[0].contract_count, 3);
        assert_eq!(company.top_naics[1].code, "541330");
        assert!(company.top_psc.is_empty());
        assert_eq!(
            company.set_aside_programs.iter().collect::<Vec<_>>(),
            vec!["8(A)", "SMALL BUSINESS SET ASIDE", "WOSB"]
        );
        assert!(company.multi_state);
        assert_eq!(company.performance_states.len(), 2);
        assert!(company.special_programs.emergency_funding);
        assert!(!company.special_programs.infrastructure_funding);
        assert_eq!(company.first_contract_date, None);
        assert_eq!(company.years_in_business, 1);
        assert_eq!(company.largest_award, 5_000.0);
    }

    #[test]
    fn top_agencies_are_ranked_by_spend_and_capped() {
        let awards = (0..12)
            .map(|i| {
                let mut record = award("Acme", Some("A1"), 100.0 * (i as f64 + 1.0));
                record.awarding_agency.name = Some(format!("Agency {i:02}"));
                record
            })
            .collect::<Vec<_>>();
        let company = aggregate_awards(&awards, today()).remove(0);
        assert_eq!(company.agency_count, 12);
        assert_eq!(company.top_agencies.len(), TOP_AGENCIES);
        assert_eq!(company.top_agencies[0].name, "Agency 11");
        assert!(company
            .top_agencies
            .windows(2)
            .all(|w| w[0].total_spend >= w[1].total_spend));
    }

    #[test]
    fn active_contracts_require_end_date_strictly_after_today() {
        let mut on_day = award("Acme", Some("A1"), 1.0);
        on_day.end_date = Some(today().to_string());
        let mut after = award("Acme", Some("A1"), 1.0);
        after.end_date = Some("2026-03-02".into());
        let company = aggregate_awards(&[on_day, after], today()).remove(0);
        assert_eq!(company.active_contracts, 1);
    }

    #[test]
    fn score_is_monotonic_in_each_factor_and_bounded() {
        let base = base_company();
        let base_score = score_company(&base, today()).opportunity_score;

        let bumps: Vec<fn(&mut AggregatedCompany)> = vec![
            |c| c.total_awards = 75_000_000.0,
            |c| c.contract_count = 60,
            |c| c.agency_count = 8,
            |c| c.active_contracts = 11,
            |c| c.years_in_business = 12,
        ];
        for bump in bumps {
            let mut bumped = base.clone();
            bump(&mut bumped);
            assert!(score_company(&bumped, today()).opportunity_score >= base_score);
        }

        let mut maxed = base;
        maxed.total_awards = 1e12;
        maxed.contract_count = 10_000;
        maxed.agency_count = 100;
        maxed.active_contracts = 10_000;
        maxed.years_in_business = 50;
        maxed.last_contract_date = Some(today());
        assert_eq!(score_company(&maxed, today()).opportunity_score, 100);
    }

    #[test]
    fn relationship_rules_apply_in_order() {
        let mut company = base_company();
        company.years_in_business = 20;
        company.contract_count = 2;
        company.agency_count = 10;
        company.total_awards = 1e9;
        assert_eq!(classify_relationship(&company), RelationshipStrength::New);

        company.contract_count = 3;
        company.agency_count = 2;
        assert_eq!(classify_relationship(&company), RelationshipStrength::Emerging);

        company.agency_count = 3;
        company.total_awards = 19_999_999.0;
        assert_eq!(classify_relationship(&company), RelationshipStrength::Established);

        company.total_awards = 20_000_000.0;
        assert_eq!(classify_relationship(&company), RelationshipStrength::Strategic);
        assert!(recommended_approach(RelationshipStrength::Strategic).starts_with("Executive"));
    }

    #[test]
    fn spending_trend_never_declines() {
        let mut company = base_company();
        company.contract_count = 10;
        company.active_contracts = 3;
        assert_eq!(spending_trend(&company), SpendingTrend::Stable);
        company.active_contracts = 4;
        assert_eq!(spending_trend(&company), SpendingTrend::Growing);
        company.active_contracts = 0;
        assert_ne!(spending_trend(&company), SpendingTrend::Declining);
    }

    #[test]
    fn decision_makers_are_flagged_by_title() {
        assert!(is_decision_maker_title("CEO"));
        assert!(is_decision_maker_title("Senior VP, Federal"));
        assert!(is_decision_maker_title("Vice President of Sales"));
        assert!(is_decision_maker_title("Director of Contracts"));
        assert!(is_decision_maker_title("Chief Technology Officer"));
        assert!(is_decision_maker_title("SVP Operations"));
        assert!(is_decision_maker_title("Cooperative Liaison"));
        assert!(is_decision_maker_title("Recruiting Coordinator"));
        assert!(!is_decision_maker_title("Contracts Manager"));
        assert!(!is_decision_maker_title("Program Analyst"));

        let contact = |title: &str| Contact {
            name: "Pat Doe".into(),
            title: title.into(),
            email: None,
            phone: None,
            linkedin_url: None,
            source: ContactSource::Enriched,
            is_decision_maker: false,
        };
        let enriched = EnrichedCompany {
            contacts: vec![contact("Program Analyst"), contact("COO")],
            company_info: None,
        };
        let lead = assemble_lead(base_company(), enriched, today());
        assert_eq!(lead.contacts.len(), 2);
        assert!(!lead.contacts[0].is_decision_maker);
        assert!(lead.contacts[1].is_decision_maker);
        assert_eq!(lead.intelligence.decision_makers.len(), 1);
        assert_eq!(lead.intelligence.decision_makers[0].title, "COO");
    }
}
