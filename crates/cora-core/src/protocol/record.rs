//! Table schemas and records.
//!
//! A [`RecordDescription`] is the ordered column list of one broker table.
//! A [`Record`] holds the `Rc` of the description it was decoded with, so it
//! can never be interpreted against another schema.

use std::fmt;
use std::rc::Rc;

use super::message::Message;
use super::types::LgrDate;
use crate::error::{Error, Result};

/// Wire type of a column element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    UInt1,
    UInt2,
    UInt4,
    Int1,
    Int2,
    Int4,
    Int8,
    Ieee4,
    Ieee8,
    Bool,
    Ascii,
    Stamp,
}

impl ValueType {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => ValueType::UInt1,
            2 => ValueType::UInt2,
            3 => ValueType::UInt4,
            4 => ValueType::Int1,
            5 => ValueType::Int2,
            6 => ValueType::Int4,
            7 => ValueType::Int8,
            8 => ValueType::Ieee4,
            9 => ValueType::Ieee8,
            10 => ValueType::Bool,
            11 => ValueType::Ascii,
            12 => ValueType::Stamp,
            _ => return None,
        })
    }

    pub fn code(&self) -> u32 {
        match self {
            ValueType::UInt1 => 1,
            ValueType::UInt2 => 2,
            ValueType::UInt4 => 3,
            ValueType::Int1 => 4,
            ValueType::Int2 => 5,
            ValueType::Int4 => 6,
            ValueType::Int8 => 7,
            ValueType::Ieee4 => 8,
            ValueType::Ieee8 => 9,
            ValueType::Bool => 10,
            ValueType::Ascii => 11,
            ValueType::Stamp => 12,
        }
    }

    /// Fewest body bytes one element of this type occupies.
    fn min_size(&self) -> usize {
        match self {
            ValueType::UInt1 | ValueType::Int1 | ValueType::Bool | ValueType::Ascii => 1,
            ValueType::UInt2 | ValueType::Int2 => 2,
            ValueType::UInt4 | ValueType::Int4 | ValueType::Ieee4 => 4,
            ValueType::Int8 | ValueType::Ieee8 | ValueType::Stamp => 8,
        }
    }

    fn read_value(&self, msg: &mut Message) -> Result<Value> {
        Ok(match self {
            ValueType::UInt1 => Value::UInt(msg.read_u1()?.into()),
            ValueType::UInt2 => Value::UInt(msg.read_u2()?.into()),
            ValueType::UInt4 => Value::UInt(msg.read_u4()?.into()),
            ValueType::Int1 => Value::Int(msg.read_i1()?.into()),
            ValueType::Int2 => Value::Int(msg.read_i2()?.into()),
            ValueType::Int4 => Value::Int(msg.read_i4()?.into()),
            ValueType::Int8 => Value::Int(msg.read_i8()?),
            ValueType::Ieee4 => Value::Float(msg.read_f4()?.into()),
            ValueType::Ieee8 => Value::Float(msg.read_f8()?),
            ValueType::Bool => Value::Bool(msg.read_bool()?),
            ValueType::Ascii => Value::Text(msg.read_str()?),
            ValueType::Stamp => Value::Stamp(msg.read_stamp()?),
        })
    }

    fn write_value(&self, value: &Value, msg: &mut Message) -> Result<()> {
        match (self, value) {
            (ValueType::UInt1, Value::UInt(v)) => msg.add_u1(*v as u8),
            (ValueType::UInt2, Value::UInt(v)) => msg.add_u2(*v as u16),
            (ValueType::UInt4, Value::UInt(v)) => msg.add_u4(*v as u32),
            (ValueType::Int1, Value::Int(v)) => msg.add_i1(*v as i8),
            (ValueType::Int2, Value::Int(v)) => msg.add_i2(*v as i16),
            (ValueType::Int4, Value::Int(v)) => msg.add_i4(*v as i32),
            (ValueType::Int8, Value::Int(v)) => msg.add_i8(*v),
            (ValueType::Ieee4, Value::Float(v)) => msg.add_f4(*v as f32),
            (ValueType::Ieee8, Value::Float(v)) => msg.add_f8(*v),
            (ValueType::Bool, Value::Bool(v)) => msg.add_bool(*v),
            (ValueType::Ascii, Value::Text(v)) => msg.add_str(v),
            (ValueType::Stamp, Value::Stamp(v)) => msg.add_stamp(*v),
            (value_type, value) => {
                return Err(Error::InvalidArgument {
                    message: format!("{:?} cannot be written as {:?}", value, value_type),
                });
            }
        }
        Ok(())
    }
}

/// One decoded column element.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    UInt(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Stamp(LgrDate),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::UInt(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
            Value::Stamp(v) => write!(f, "{}", v),
        }
    }
}

/// Description of one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueDesc {
    pub name: String,
    pub value_type: ValueType,
    pub units: String,
    pub process: String,
    /// Array dimensions; empty for a scalar.
    pub dims: Vec<u32>,
}

impl ValueDesc {
    pub fn scalar(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            units: String::new(),
            process: String::new(),
            dims: Vec::new(),
        }
    }

    /// Number of elements stored per record, or `None` when the
    /// dimensions overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |count, dim| count.checked_mul(*dim as usize))
    }

    fn read(msg: &mut Message) -> Result<Self> {
        let name = msg.read_str()?;
        let code = msg.read_u4()?;
        let value_type = ValueType::from_code(code).ok_or_else(|| Error::Codec {
            message: format!("unknown value type {} for column {}", code, name),
        })?;
        let units = msg.read_str()?;
        let process = msg.read_str()?;
        let dim_count = msg.read_u4()?;
        let mut dims = Vec::new();
        for _ in 0..dim_count {
            dims.push(msg.read_u4()?);
        }
        let desc = Self {
            name,
            value_type,
            units,
            process,
            dims,
        };
        if desc.element_count().is_none() {
            return Err(Error::Codec {
                message: format!("dimensions of column {} overflow", desc.name),
            });
        }
        Ok(desc)
    }

    fn write(&self, msg: &mut Message) {
        msg.add_str(&self.name);
        msg.add_u4(self.value_type.code());
        msg.add_str(&self.units);
        msg.add_str(&self.process);
        msg.add_u4(self.dims.len() as u32);
        for dim in &self.dims {
            msg.add_u4(*dim);
        }
    }
}

/// Ordered column list of a broker table.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDescription {
    pub broker: String,
    pub table: String,
    pub values: Vec<ValueDesc>,
}

impl RecordDescription {
    pub fn new(broker: impl Into<String>, table: impl Into<String>, values: Vec<ValueDesc>) -> Self {
        Self {
            broker: broker.into(),
            table: table.into(),
            values,
        }
    }

    /// Decode a table definition: table name, column count, columns.
    pub fn read(broker: &str, msg: &mut Message) -> Result<Self> {
        let table = msg.read_str()?;
        let count = msg.read_u4()?;
        let mut values = Vec::new();
        for _ in 0..count {
            values.push(ValueDesc::read(msg)?);
        }
        Ok(Self::new(broker, table, values))
    }

    pub fn write(&self, msg: &mut Message) {
        msg.add_str(&self.table);
        msg.add_u4(self.values.len() as u32);
        for value in &self.values {
            value.write(msg);
        }
    }

    /// Position of a column by name.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.values.iter().position(|v| v.name == name)
    }

    /// Copy of this description restricted to the named columns, in the
    /// order given. An empty selection keeps every column.
    pub fn select(&self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self.clone());
        }
        let mut values = Vec::with_capacity(names.len());
        for name in names {
            let index = self.find(name).ok_or_else(|| Error::InvalidArgument {
                message: format!("table {} has no column {}", self.table, name),
            })?;
            values.push(self.values[index].clone());
        }
        Ok(Self::new(self.broker.clone(), self.table.clone(), values))
    }
}

/// One table row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    description: Rc<RecordDescription>,
    pub file_mark_no: u32,
    pub record_no: u32,
    pub stamp: LgrDate,
    /// One element vector per column, in description order.
    pub values: Vec<Vec<Value>>,
}

impl Record {
    /// Build a record from values; the shape must match the description.
    pub fn new(
        description: Rc<RecordDescription>,
        file_mark_no: u32,
        record_no: u32,
        stamp: LgrDate,
        values: Vec<Vec<Value>>,
    ) -> Result<Self> {
        let shape_ok = values.len() == description.values.len()
            && values
                .iter()
                .zip(&description.values)
                .all(|(v, d)| d.element_count() == Some(v.len()));
        if !shape_ok {
            return Err(Error::InvalidArgument {
                message: format!("record values do not match table {}", description.table),
            });
        }
        Ok(Self {
            description,
            file_mark_no,
            record_no,
            stamp,
            values,
        })
    }

    pub fn read(description: Rc<RecordDescription>, msg: &mut Message) -> Result<Self> {
        let file_mark_no = msg.read_u4()?;
        let record_no = msg.read_u4()?;
        let stamp = msg.read_stamp()?;
        let mut values = Vec::with_capacity(description.values.len());
        for desc in &description.values {
            let count = desc
                .element_count()
                .filter(|count| count.saturating_mul(desc.value_type.min_size()) <= msg.remaining())
                .ok_or_else(|| Error::truncated(&desc.name))?;
            let mut elements = Vec::with_capacity(count);
            for _ in 0..count {
                elements.push(desc.value_type.read_value(msg)?);
            }
            values.push(elements);
        }
        Ok(Self {
            description,
            file_mark_no,
            record_no,
            stamp,
            values,
        })
    }

    pub fn write(&self, msg: &mut Message) -> Result<()> {
        msg.add_u4(self.file_mark_no);
        msg.add_u4(self.record_no);
        msg.add_stamp(self.stamp);
        for (desc, elements) in self.description.values.iter().zip(&self.values) {
            for element in elements {
                desc.value_type.write_value(element, msg)?;
            }
        }
        Ok(())
    }

    pub fn description(&self) -> &Rc<RecordDescription> {
        &self.description
    }

    /// Elements of a column by name.
    pub fn value(&self, name: &str) -> Option<&[Value]> {
        let index = self.description.find(name)?;
        self.values.get(index).map(Vec::as_slice)
    }
}

/// Records delivered by one advise notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    pub description: Rc<RecordDescription>,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(description: Rc<RecordDescription>, records: Vec<Record>) -> Self {
        Self {
            description,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&Record> {
        self.records.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionNo;

    fn description() -> Rc<RecordDescription> {
        let mut temps = ValueDesc::scalar("Temp", ValueType::Ieee4);
        temps.units = "degC".into();
        temps.dims = vec![2];
        Rc::new(RecordDescription::new(
            "ws1",
            "Status",
            vec![
                ValueDesc::scalar("Battery", ValueType::Ieee8),
                temps,
                ValueDesc::scalar("Station", ValueType::Ascii),
                ValueDesc::scalar("Count", ValueType::UInt4),
            ],
        ))
    }

    #[test]
    fn description_roundtrip_and_find() {
        let desc = description();
        let mut msg = Message::new(SessionNo(1), 0);
        desc.write(&mut msg);
        let decoded = RecordDescription::read("ws1", &mut msg).unwrap();
        assert_eq!(&decoded, desc.as_ref());
        assert_eq!(decoded.find("Station"), Some(2));
        assert_eq!(decoded.find("Missing"), None);
        assert_eq!(decoded.values[1].element_count(), Some(2));
        assert_eq!(decoded.values[0].element_count(), Some(1));
    }

    #[test]
    fn select_keeps_requested_order() {
        let desc = description();
        let picked = desc.select(&["Count".into(), "Battery".into()]).unwrap();
        let names: Vec<_> = picked.values.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["Count", "Battery"]);

        assert_eq!(desc.select(&[]).unwrap(), *desc);
        assert!(desc.select(&["Nope".into()]).is_err());
    }

    #[test]
    fn record_roundtrip() {
        let desc = description();
        let record = Record::new(
            desc.clone(),
            1,
            42,
            LgrDate::from_secs(1000),
            vec![
                vec![Value::Float(12.5)],
                vec![Value::Float(20.0), Value::Float(21.5)],
                vec![Value::Text("north".into())],
                vec![Value::UInt(7)],
            ],
        )
        .unwrap();

        let mut msg = Message::new(SessionNo(1), 0);
        record.write(&mut msg).unwrap();
        let decoded = Record::read(desc.clone(), &mut msg).unwrap();
        assert_eq!(decoded, record);
        assert!(Rc::ptr_eq(decoded.description(), &desc));
        assert_eq!(decoded.value("Count"), Some(&[Value::UInt(7)][..]));
    }

    #[test]
    fn record_shape_is_checked() {
        let result = Record::new(description(), 1, 1, LgrDate(0), vec![vec![Value::Float(1.0)]]);
        assert!(result.is_err());
    }

    #[test]
    fn truncated_record_fails() {
        let desc = description();
        let mut msg = Message::new(SessionNo(1), 0);
        msg.add_u4(1);
        msg.add_u4(2);
        assert!(Record::read(desc, &mut msg).unwrap_err().is_parse_error());
    }

    #[test]
    fn overflowing_dimensions_are_codec_error() {
        let mut column = ValueDesc::scalar("Grid", ValueType::Ieee4);
        column.dims = vec![1 << 22, 1 << 22, 1 << 22];
        assert_eq!(column.element_count(), None);
        let mut msg = Message::new(SessionNo(1), 0);
        RecordDescription::new("b", "T", vec![column]).write(&mut msg);
        assert!(RecordDescription::read("b", &mut msg).unwrap_err().is_parse_error());
    }

    #[test]
    fn huge_array_larger_than_body_fails_without_allocating() {
        let mut column = ValueDesc::scalar("Grid", ValueType::Ieee4);
        column.dims = vec![u32::MAX];
        let desc = Rc::new(RecordDescription::new("b", "T", vec![column]));
        let mut msg = Message::new(SessionNo(1), 0);
        msg.add_u4(1);
        msg.add_u4(2);
        msg.add_stamp(LgrDate(0));
        msg.add_f4(1.0);
        assert!(Record::read(desc, &mut msg).unwrap_err().is_parse_error());
    }

    #[test]
    fn unknown_value_type_is_codec_error() {
        let mut msg = Message::new(SessionNo(1), 0);
        msg.add_str("T");
        msg.add_u4(1);
        msg.add_str("x");
        msg.add_u4(99);
        assert!(RecordDescription::read("b", &mut msg).unwrap_err().is_parse_error());
    }
}
