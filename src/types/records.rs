//! Fiscal line records
//!
//! One variant per EFD record type the worker persists. Every variant is a
//! flat set of positional fields already converted to typed values.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::tax_rates::ProjectedTaxes;

/// Operation direction (`IND_OPER`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// `0` = entrada (inbound), `1` = saída (outbound)
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "0" => Some(Direction::Inbound),
            "1" => Some(Direction::Outbound),
            _ => None,
        }
    }

    /// Stored form, the same code the file uses
    pub const fn code(self) -> &'static str {
        match self {
            Direction::Inbound => "0",
            Direction::Outbound => "1",
        }
    }
}

/// `0000`: file header with the branch identity and period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchHeader {
    pub company_name: String,
    pub cnpj: String,
    pub uf: String,
    pub ie: String,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
}

/// `0150`: participant (counterparty) registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub cod_part: String,
    pub name: String,
    pub cod_pais: String,
    pub cnpj: String,
    pub cpf: String,
    pub ie: String,
    pub cod_mun: String,
}

/// `C100`: merchandise document (NF-e and friends)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchandiseDocument {
    pub direction: Direction,
    pub ind_emit: String,
    pub cod_part: String,
    pub cod_mod: String,
    pub cod_sit: String,
    pub serie: String,
    pub num_doc: String,
    pub chv_nfe: String,
    pub dt_doc: Option<NaiveDate>,
    pub dt_e_s: Option<NaiveDate>,
    pub vl_doc: f64,
    pub vl_icms: f64,
    pub vl_icms_st: f64,
    pub vl_ipi: f64,
    pub vl_pis: f64,
    pub vl_cofins: f64,
    pub projected: ProjectedTaxes,
}

/// `C170`: item of the most recent `C100`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentItem {
    pub num_item: String,
    pub cod_item: String,
    pub description: String,
    pub quantity: f64,
    pub unit: String,
    pub vl_item: f64,
    pub vl_desc: f64,
    pub cst_icms: String,
    pub cfop: String,
    pub vl_bc_icms: f64,
    pub aliq_icms: f64,
    pub vl_icms: f64,
    pub vl_ipi: f64,
    pub vl_pis: f64,
    pub vl_cofins: f64,
    pub projected: ProjectedTaxes,
}

/// `C500`: electricity / gas / water bill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyDocument {
    pub direction: Direction,
    pub cod_part: String,
    pub cod_mod: String,
    pub cod_sit: String,
    pub num_doc: String,
    pub dt_doc: Option<NaiveDate>,
    pub dt_e_s: Option<NaiveDate>,
    pub vl_doc: f64,
    pub vl_icms: f64,
    pub vl_pis: f64,
    pub vl_cofins: f64,
    pub projected: ProjectedTaxes,
}

/// `C600`: daily consolidation of consumption bills (outbound only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionDocument {
    pub cod_mod: String,
    pub cod_mun: String,
    pub dt_doc: Option<NaiveDate>,
    pub vl_doc: f64,
    pub vl_icms: f64,
    pub vl_pis: f64,
    pub vl_cofins: f64,
    pub projected: ProjectedTaxes,
}

/// `D100`: transport document (CT-e)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDocument {
    pub direction: Direction,
    pub cod_part: String,
    pub cod_mod: String,
    pub cod_sit: String,
    pub num_doc: String,
    pub chv_cte: String,
    pub dt_doc: Option<NaiveDate>,
    pub dt_a_p: Option<NaiveDate>,
    pub vl_doc: f64,
    pub vl_icms: f64,
    pub projected: ProjectedTaxes,
}

/// `D500`: communication / telecom service document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunicationDocument {
    pub direction: Direction,
    pub cod_part: String,
    pub cod_mod: String,
    pub cod_sit: String,
    pub num_doc: String,
    pub dt_doc: Option<NaiveDate>,
    pub dt_a_p: Option<NaiveDate>,
    pub vl_doc: f64,
    pub vl_icms: f64,
    pub vl_pis: f64,
    pub vl_cofins: f64,
    pub projected: ProjectedTaxes,
}

/// A parsed line, ready to be persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FiscalRecord {
    Header(BranchHeader),
    Participant(Participant),
    Document(MerchandiseDocument),
    DocumentItem(DocumentItem),
    Energy(EnergyDocument),
    Consumption(ConsumptionDocument),
    Transport(TransportDocument),
    Communication(CommunicationDocument),
    /// `9999` or the block-9 close of a filtered export
    Terminator,
}

impl FiscalRecord {
    /// Record tag this variant was parsed from, used for counting
    pub const fn tag(&self) -> &'static str {
        match self {
            FiscalRecord::Header(_) => "0000",
            FiscalRecord::Participant(_) => "0150",
            FiscalRecord::Document(_) => "C100",
            FiscalRecord::DocumentItem(_) => "C170",
            FiscalRecord::Energy(_) => "C500",
            FiscalRecord::Consumption(_) => "C600",
            FiscalRecord::Transport(_) => "D100",
            FiscalRecord::Communication(_) => "D500",
            FiscalRecord::Terminator => "9999",
        }
    }
}

/// Destination table for each persisted tag
pub const RECORD_TABLES: &[(&str, &str)] = &[
    ("0150", "efd_participants"),
    ("C100", "efd_c100"),
    ("C170", "efd_c170"),
    ("C500", "efd_c500"),
    ("C600", "efd_c600"),
    ("D100", "efd_d100"),
    ("D500", "efd_d500"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_code() {
        assert_eq!(Direction::from_code("0"), Some(Direction::Inbound));
        assert_eq!(Direction::from_code("1"), Some(Direction::Outbound));
        assert_eq!(Direction::from_code(""), None);
        assert_eq!(Direction::from_code("2"), None);
    }

    #[test]
    fn test_direction_code_matches_file_code() {
        for direction in [Direction::Inbound, Direction::Outbound] {
            assert_eq!(Direction::from_code(direction.code()), Some(direction));
        }
        assert_eq!(Direction::Outbound.code(), "1");
    }

    #[test]
    fn test_every_persisted_tag_has_a_table() {
        for tag in ["0150", "C100", "C170", "C500", "C600", "D100", "D500"] {
            assert!(RECORD_TABLES.iter().any(|(t, _)| *t == tag), "missing table for {}", tag);
        }
        assert!(!RECORD_TABLES.iter().any(|(t, _)| *t == "0000"));
    }
}
