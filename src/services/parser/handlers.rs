//! Record handlers and the tag registry
//!
//! Each handler knows one record layout. Supporting a new record type means
//! adding a handler and registering it; the parse loop never changes.

use std::collections::HashMap;

use crate::types::{
    BranchHeader, CommunicationDocument, ConsumptionDocument, Direction, DocumentItem,
    EnergyDocument, FiscalRecord, MerchandiseDocument, Participant, TaxRates, TransportDocument,
};

use super::fields::{looks_like_record, Fields};

/// What the handler may need besides the line itself
pub struct ParseContext<'a> {
    pub rates: &'a TaxRates,
}

pub trait RecordHandler: Send + Sync {
    fn tag(&self) -> &'static str;

    /// Minimum number of `|`-separated parts (leading empty part included)
    fn min_fields(&self) -> usize;

    /// `None` means the line is skipped
    fn parse(&self, fields: &Fields<'_>, ctx: &ParseContext<'_>) -> Option<FiscalRecord>;
}

/// Result of routing one line
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    Record(FiscalRecord),
    /// Known tag whose line could not be used (too short, bad direction)
    Skipped(&'static str),
    /// Not a record line, or a record type the worker does not store
    Ignored,
}

pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Box<dyn RecordHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Handlers for every record type the worker persists
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(HeaderHandler));
        registry.register(Box::new(ParticipantHandler));
        registry.register(Box::new(DocumentHandler));
        registry.register(Box::new(ItemHandler));
        registry.register(Box::new(EnergyHandler));
        registry.register(Box::new(ConsumptionHandler));
        registry.register(Box::new(TransportHandler));
        registry.register(Box::new(CommunicationHandler));
        registry.register(Box::new(TerminatorHandler("9999")));
        registry.register(Box::new(TerminatorHandler("9990")));
        registry
    }

    /// Later registrations replace earlier ones for the same tag
    pub fn register(&mut self, handler: Box<dyn RecordHandler>) {
        self.handlers.insert(handler.tag(), handler);
    }

    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.handlers.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    pub fn dispatch(&self, line: &str, ctx: &ParseContext<'_>) -> Dispatch {
        if !looks_like_record(line) {
            return Dispatch::Ignored;
        }

        let fields = Fields::split(line);
        let Some(handler) = self.handlers.get(fields.tag()) else {
            return Dispatch::Ignored;
        };

        if fields.len() < handler.min_fields() {
            return Dispatch::Skipped(handler.tag());
        }

        match handler.parse(&fields, ctx) {
            Some(record) => Dispatch::Record(record),
            None => Dispatch::Skipped(handler.tag()),
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

struct HeaderHandler;

impl RecordHandler for HeaderHandler {
    fn tag(&self) -> &'static str {
        "0000"
    }

    fn min_fields(&self) -> usize {
        10
    }

    fn parse(&self, f: &Fields<'_>, _ctx: &ParseContext<'_>) -> Option<FiscalRecord> {
        Some(FiscalRecord::Header(BranchHeader {
            period_start: f.date(4),
            period_end: f.date(5),
            company_name: f.owned(6),
            cnpj: f.owned(7),
            uf: f.owned(9),
            ie: f.owned(10),
        }))
    }
}

struct ParticipantHandler;

impl RecordHandler for ParticipantHandler {
    fn tag(&self) -> &'static str {
        "0150"
    }

    fn min_fields(&self) -> usize {
        8
    }

    fn parse(&self, f: &Fields<'_>, _ctx: &ParseContext<'_>) -> Option<FiscalRecord> {
        let cod_part = f.owned(2);
        if cod_part.is_empty() {
            return None;
        }
        Some(FiscalRecord::Participant(Participant {
            cod_part,
            name: f.owned(3),
            cod_pais: f.owned(4),
            cnpj: f.owned(5),
            cpf: f.owned(6),
            ie: f.owned(7),
            cod_mun: f.owned(8),
        }))
    }
}

struct DocumentHandler;

impl RecordHandler for DocumentHandler {
    fn tag(&self) -> &'static str {
        "C100"
    }

    fn min_fields(&self) -> usize {
        28
    }

    fn parse(&self, f: &Fields<'_>, ctx: &ParseContext<'_>) -> Option<FiscalRecord> {
        let direction = Direction::from_code(f.text(2))?;
        let vl_doc = f.decimal(12);
        let vl_icms = f.decimal(22);
        Some(FiscalRecord::Document(MerchandiseDocument {
            direction,
            ind_emit: f.owned(3),
            cod_part: f.owned(4),
            cod_mod: f.owned(5),
            cod_sit: f.owned(6),
            serie: f.owned(7),
            num_doc: f.owned(8),
            chv_nfe: f.owned(9),
            dt_doc: f.date(10),
            dt_e_s: f.date(11),
            vl_doc,
            vl_icms,
            vl_icms_st: f.decimal(24),
            vl_ipi: f.decimal(25),
            vl_pis: f.decimal(26),
            vl_cofins: f.decimal(27),
            projected: ctx.rates.project(vl_doc, vl_icms),
        }))
    }
}

struct ItemHandler;

impl RecordHandler for ItemHandler {
    fn tag(&self) -> &'static str {
        "C170"
    }

    fn min_fields(&self) -> usize {
        37
    }

    fn parse(&self, f: &Fields<'_>, ctx: &ParseContext<'_>) -> Option<FiscalRecord> {
        let vl_item = f.decimal(7);
        let vl_icms = f.decimal(15);
        Some(FiscalRecord::DocumentItem(DocumentItem {
            num_item: f.owned(2),
            cod_item: f.owned(3),
            description: f.owned(4),
            quantity: f.decimal(5),
            unit: f.owned(6),
            vl_item,
            vl_desc: f.decimal(8),
            cst_icms: f.owned(10),
            cfop: f.owned(11),
            vl_bc_icms: f.decimal(13),
            aliq_icms: f.decimal(14),
            vl_icms,
            vl_ipi: f.decimal(24),
            vl_pis: f.decimal(30),
            vl_cofins: f.decimal(36),
            projected: ctx.rates.project(vl_item, vl_icms),
        }))
    }
}

struct EnergyHandler;

impl RecordHandler for EnergyHandler {
    fn tag(&self) -> &'static str {
        "C500"
    }

    fn min_fields(&self) -> usize {
        26
    }

    fn parse(&self, f: &Fields<'_>, ctx: &ParseContext<'_>) -> Option<FiscalRecord> {
        let direction = Direction::from_code(f.text(2))?;
        let vl_doc = f.decimal(13);
        let vl_icms = f.decimal(20);
        Some(FiscalRecord::Energy(EnergyDocument {
            direction,
            cod_part: f.owned(4),
            cod_mod: f.owned(5),
            cod_sit: f.owned(6),
            num_doc: f.owned(10),
            dt_doc: f.date(11),
            dt_e_s: f.date(12),
            vl_doc,
            vl_icms,
            vl_pis: f.decimal(24),
            vl_cofins: f.decimal(25),
            projected: ctx.rates.project(vl_doc, vl_icms),
        }))
    }
}

struct ConsumptionHandler;

impl RecordHandler for ConsumptionHandler {
    fn tag(&self) -> &'static str {
        "C600"
    }

    fn min_fields(&self) -> usize {
        23
    }

    fn parse(&self, f: &Fields<'_>, ctx: &ParseContext<'_>) -> Option<FiscalRecord> {
        let vl_doc = f.decimal(10);
        let vl_icms = f.decimal(18);
        Some(FiscalRecord::Consumption(ConsumptionDocument {
            cod_mod: f.owned(2),
            cod_mun: f.owned(3),
            dt_doc: f.date(9),
            vl_doc,
            vl_icms,
            vl_pis: f.decimal(21),
            vl_cofins: f.decimal(22),
            projected: ctx.rates.project(vl_doc, vl_icms),
        }))
    }
}

struct TransportHandler;

impl RecordHandler for TransportHandler {
    fn tag(&self) -> &'static str {
        "D100"
    }

    fn min_fields(&self) -> usize {
        22
    }

    fn parse(&self, f: &Fields<'_>, ctx: &ParseContext<'_>) -> Option<FiscalRecord> {
        let direction = Direction::from_code(f.text(2))?;
        let vl_doc = f.decimal(15);
        let vl_icms = f.decimal(20);
        Some(FiscalRecord::Transport(TransportDocument {
            direction,
            cod_part: f.owned(4),
            cod_mod: f.owned(5),
            cod_sit: f.owned(6),
            num_doc: f.owned(9),
            chv_cte: f.owned(10),
            dt_doc: f.date(11),
            dt_a_p: f.date(12),
            vl_doc,
            vl_icms,
            projected: ctx.rates.project(vl_doc, vl_icms),
        }))
    }
}

struct CommunicationHandler;

impl RecordHandler for CommunicationHandler {
    fn tag(&self) -> &'static str {
        "D500"
    }

    fn min_fields(&self) -> usize {
        23
    }

    fn parse(&self, f: &Fields<'_>, ctx: &ParseContext<'_>) -> Option<FiscalRecord> {
        let direction = Direction::from_code(f.text(2))?;
        let vl_doc = f.decimal(12);
        let vl_icms = f.decimal(19);
        Some(FiscalRecord::Communication(CommunicationDocument {
            direction,
            cod_part: f.owned(4),
            cod_mod: f.owned(5),
            cod_sit: f.owned(6),
            num_doc: f.owned(9),
            dt_doc: f.date(10),
            dt_a_p: f.date(11),
            vl_doc,
            vl_icms,
            vl_pis: f.decimal(21),
            vl_cofins: f.decimal(22),
            projected: ctx.rates.project(vl_doc, vl_icms),
        }))
    }
}

/// `9999`, or `9990` closing block 9 of filtered exports
struct TerminatorHandler(&'static str);

impl RecordHandler for TerminatorHandler {
    fn tag(&self) -> &'static str {
        self.0
    }

    fn min_fields(&self) -> usize {
        2
    }

    fn parse(&self, _f: &Fields<'_>, _ctx: &ParseContext<'_>) -> Option<FiscalRecord> {
        Some(FiscalRecord::Terminator)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures;
    use super::*;
    use chrono::NaiveDate;

    fn ctx_rates() -> TaxRates {
        TaxRates::default_for_year(2026)
    }

    fn dispatch(line: &str) -> Dispatch {
        let rates = ctx_rates();
        HandlerRegistry::standard().dispatch(line, &ParseContext { rates: &rates })
    }

    #[test]
    fn test_standard_registry_covers_every_stored_tag() {
        let tags = HandlerRegistry::standard().tags();
        assert_eq!(
            tags,
            vec!["0000", "0150", "9990", "9999", "C100", "C170", "C500", "C600", "D100", "D500"]
        );
    }

    #[test]
    fn test_header_fields() {
        let Dispatch::Record(FiscalRecord::Header(header)) = dispatch(&fixtures::header("11222333000181", "01012026")) else {
            panic!("expected header");
        };
        assert_eq!(header.cnpj, "11222333000181");
        assert_eq!(header.company_name, "ACME LTDA");
        assert_eq!(header.uf, "SP");
        assert_eq!(header.period_start, NaiveDate::from_ymd_opt(2026, 1, 1));
        assert_eq!(header.period_end, NaiveDate::from_ymd_opt(2026, 1, 31));
    }

    #[test]
    fn test_document_fields_and_projection() {
        let Dispatch::Record(FiscalRecord::Document(doc)) = dispatch(&fixtures::document("0", "FORN01", "1.000,00", "180,00")) else {
            panic!("expected C100");
        };
        assert_eq!(doc.direction, Direction::Inbound);
        assert_eq!(doc.cod_part, "FORN01");
        assert_eq!(doc.vl_doc, 1000.0);
        assert_eq!(doc.vl_icms, 180.0);
        assert_eq!(doc.vl_pis, 1.65);
        assert_eq!(doc.dt_doc, NaiveDate::from_ymd_opt(2026, 1, 15));
        assert_eq!(doc.projected, ctx_rates().project(1000.0, 180.0));
    }

    #[test]
    fn test_document_with_bad_direction_is_skipped() {
        assert_eq!(dispatch(&fixtures::document("7", "X", "1,00", "0")), Dispatch::Skipped("C100"));
    }

    #[test]
    fn test_short_line_is_skipped() {
        assert_eq!(dispatch("|C100|0|1|FORN01|"), Dispatch::Skipped("C100"));
        assert_eq!(dispatch("|C170|1|"), Dispatch::Skipped("C170"));
    }

    #[test]
    fn test_unknown_or_garbage_lines_are_ignored() {
        assert_eq!(dispatch("|C190|000|5102|18,00|"), Dispatch::Ignored);
        assert_eq!(dispatch("not a record"), Dispatch::Ignored);
        assert_eq!(dispatch(""), Dispatch::Ignored);
    }

    #[test]
    fn test_both_terminators() {
        assert_eq!(dispatch("|9999|42|"), Dispatch::Record(FiscalRecord::Terminator));
        assert_eq!(dispatch("|9990|7|"), Dispatch::Record(FiscalRecord::Terminator));
    }

    #[test]
    fn test_item_and_other_documents_parse() {
        assert!(matches!(dispatch(&fixtures::item("1", "250,00")), Dispatch::Record(FiscalRecord::DocumentItem(_))));
        assert!(matches!(dispatch(&fixtures::energy("1")), Dispatch::Record(FiscalRecord::Energy(_))));
        assert!(matches!(dispatch(&fixtures::consumption()), Dispatch::Record(FiscalRecord::Consumption(_))));
        assert!(matches!(dispatch(&fixtures::transport("0")), Dispatch::Record(FiscalRecord::Transport(_))));
        assert!(matches!(dispatch(&fixtures::communication("1")), Dispatch::Record(FiscalRecord::Communication(_))));
    }

    #[test]
    fn test_registered_handler_replaces_builtin() {
        struct Silent;
        impl RecordHandler for Silent {
            fn tag(&self) -> &'static str {
                "0150"
            }
            fn min_fields(&self) -> usize {
                2
            }
            fn parse(&self, _f: &Fields<'_>, _ctx: &ParseContext<'_>) -> Option<FiscalRecord> {
                None
            }
        }

        let mut registry = HandlerRegistry::standard();
        registry.register(Box::new(Silent));
        let rates = ctx_rates();
        assert_eq!(
            registry.dispatch(&fixtures::participant("P1"), &ParseContext { rates: &rates }),
            Dispatch::Skipped("0150")
        );
    }
}
