use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Typed binary (de)serialization over any byte sink.
///
/// All multi-byte integers on the wire are little-endian. Variable-size
/// fields carry explicit lengths so payloads are self-delimiting on both the
/// stream and datagram transports.
pub trait Bytes: Sized {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error>;
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error>;
}

pub(crate) fn write_string(writer: &mut impl WriteBytesExt, s: &str) -> Result<(), io::Error> {
    if s.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "string exceeds wire length limit",
        ));
    }
    writer.write_u16::<LittleEndian>(s.len() as u16)?;
    writer.write_all(s.as_bytes())
}

pub(crate) fn read_string(reader: &mut impl ReadBytesExt) -> Result<String, io::Error> {
    let len = reader.read_u16::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not valid utf-8"))
}

pub(crate) fn write_opt_string(
    writer: &mut impl WriteBytesExt,
    s: &Option<String>,
) -> Result<(), io::Error> {
    match s {
        Some(s) => {
            writer.write_u8(1)?;
            write_string(writer, s)
        }
        None => writer.write_u8(0),
    }
}

pub(crate) fn read_opt_string(reader: &mut impl ReadBytesExt) -> Result<Option<String>, io::Error> {
    match reader.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(read_string(reader)?)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid option marker",
        )),
    }
}

pub(crate) fn write_blob(writer: &mut impl WriteBytesExt, blob: &[u8]) -> Result<(), io::Error> {
    if blob.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "blob exceeds wire length limit",
        ));
    }
    writer.write_u16::<LittleEndian>(blob.len() as u16)?;
    writer.write_all(blob)
}

pub(crate) fn read_blob(reader: &mut impl ReadBytesExt) -> Result<Vec<u8>, io::Error> {
    let len = reader.read_u16::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn write_list<T: Bytes>(
    writer: &mut impl WriteBytesExt,
    items: &[T],
) -> Result<(), io::Error> {
    if items.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "list exceeds wire length limit",
        ));
    }
    writer.write_u16::<LittleEndian>(items.len() as u16)?;
    for item in items {
        item.write_to(writer)?;
    }
    Ok(())
}

pub(crate) fn read_list<T: Bytes>(reader: &mut impl ReadBytesExt) -> Result<Vec<T>, io::Error> {
    let len = reader.read_u16::<LittleEndian>()? as usize;
    let mut items = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        items.push(T::read_from(reader)?);
    }
    Ok(items)
}
