//! Result-set backend messages.
//!
//! Rows and field descriptions are parsed into plain values up front; only
//! the column bytes themselves stay borrowed from the payload.

use crate::error::Result;
use crate::protocol::codec::Scan;
use crate::protocol::types::{FormatCode, Oid};

/// One column of a RowDescription.
#[derive(Debug, Clone)]
pub struct Field<'a> {
    /// Column name
    pub name: &'a str,
    /// Table OID (0 if not a table column)
    pub table_oid: Oid,
    /// Column attribute number (0 if not a table column)
    pub column_attr: i16,
    /// Data type OID
    pub type_oid: Oid,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: i16,
    /// Type modifier (type-specific)
    pub type_modifier: i32,
    /// Wire format code of the values
    pub format: FormatCode,
}

/// RowDescription ('T'): the shape of the rows that follow.
#[derive(Debug)]
pub struct RowDescription<'a> {
    pub fields: Vec<Field<'a>>,
}

impl<'a> RowDescription<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut scan = Scan::new(payload);
        let field_count = scan.u16()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(Field {
                name: scan.cstr()?,
                table_oid: scan.u32()?,
                column_attr: scan.i16()?,
                type_oid: scan.u32()?,
                type_size: scan.i16()?,
                type_modifier: scan.i32()?,
                format: FormatCode::from_u16(scan.u16()?),
            });
        }
        Ok(Self { fields })
    }
}

/// DataRow ('D'): one row, split into per-column slices. `None` is NULL.
#[derive(Debug)]
pub struct DataRow<'a> {
    pub columns: Vec<Option<&'a [u8]>>,
}

impl<'a> DataRow<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let mut scan = Scan::new(payload);
        let column_count = scan.u16()?;
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let len = scan.i32()?;
            columns.push(if len < 0 {
                None
            } else {
                Some(scan.bytes(len as usize)?)
            });
        }
        Ok(Self { columns })
    }
}

/// CommandComplete ('C') with its textual command tag.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// Command tag, e.g. "SELECT 5", "INSERT 0 1", "UPDATE 10"
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        Ok(Self {
            tag: Scan::new(payload).cstr()?,
        })
    }
}
