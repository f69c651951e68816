use std::sync::Arc;

use plcrpc::Error;
use plcrpc::Resolve;
use plcrpc::Result;

use crate::ads::field::DirectField;
use crate::ads::field::SymbolicField;
use crate::ads::message::AdsData;
use crate::ads::message::MultiRequestItem;
use crate::ads::message::Reader;
use crate::ads::message::ReturnCode;
use crate::ads::message::SUMUP_READ_WRITE;
use crate::ads::message::SYM_HNDBYNAME;
use crate::ads::message::SYM_VALBYHND;
use crate::ads::session::Session;

/// Looks up symbol handles on the device.
pub(crate) struct SymbolResolver {
    session: Arc<Session>,
}

impl SymbolResolver {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

fn symbol_name(key: &SymbolicField) -> Vec<u8> {
    let mut name = Vec::with_capacity(key.name.len() + 1);
    name.extend_from_slice(key.name.as_bytes());
    name.push(0);
    name
}

fn by_handle(key: &SymbolicField, handle: u32) -> DirectField {
    DirectField { index_group: SYM_VALBYHND, index_offset: handle, data_type: key.data_type, elements: key.elements }
}

fn truncated(what: &str) -> Error {
    Error::protocol(ReturnCode::InvalidSize.code(), format!("truncated {}", what))
}

#[async_trait::async_trait]
impl Resolve<SymbolicField, DirectField> for SymbolResolver {
    async fn resolve_one(&self, key: &SymbolicField) -> Result<DirectField> {
        let request = AdsData::ReadWriteRequest {
            index_group: SYM_HNDBYNAME,
            index_offset: 0,
            read_length: 4,
            items: Vec::new(),
            data: symbol_name(key),
        };

        let AdsData::ReadWriteResponse { result, data } = self.session.exchange(request).await? else {
            return Err(Error::resolution(&key.name, "unexpected response to a handle lookup"));
        };
        if !result.is_ok() {
            return Err(Error::resolution(&key.name, result.to_string()));
        }
        let handle = Reader::new(&data).u32().ok_or_else(|| truncated("symbol handle"))?;
        tracing::debug!(symbol = %key.name, handle, "resolved symbol");
        Ok(by_handle(key, handle))
    }

    async fn resolve_batch(&self, keys: &[SymbolicField]) -> Result<Vec<Result<DirectField>>> {
        let names: Vec<Vec<u8>> = keys.iter().map(symbol_name).collect();
        let items = keys
            .iter()
            .zip(&names)
            .map(|(key, name)| {
                let write_length =
                    u32::try_from(name.len()).map_err(|_| Error::resolution(&key.name, "symbol name too long"))?;
                Ok(MultiRequestItem::ReadWrite { index_group: SYM_HNDBYNAME, index_offset: 0, read_length: 4, write_length })
            })
            .collect::<Result<Vec<_>>>()?;
        let (count, read_length) = u32::try_from(keys.len())
            .ok()
            .and_then(|count| Some((count, count.checked_mul(12)?)))
            .ok_or_else(|| Error::protocol(ReturnCode::InvalidSize.code(), "too many symbols for one lookup"))?;
        let request = AdsData::ReadWriteRequest {
            index_group: SUMUP_READ_WRITE,
            index_offset: count,
            read_length,
            items,
            data: names.concat(),
        };

        let AdsData::ReadWriteResponse { result, data } = self.session.exchange(request).await? else {
            return Err(Error::protocol(0, "unexpected response to a handle lookup"));
        };
        if !result.is_ok() {
            return Err(Error::protocol(result.code(), "sum handle lookup rejected"));
        }

        // One (code, length) header per item, then each item's data.
        let mut reader = Reader::new(&data);
        let mut headers = Vec::with_capacity(keys.len());
        for _ in keys {
            let code = reader.return_code().ok_or_else(|| truncated("item header"))?;
            let length = reader.u32().ok_or_else(|| truncated("item header"))?;
            headers.push((code, length as usize));
        }

        let mut resolved = Vec::with_capacity(keys.len());
        for (key, (code, length)) in keys.iter().zip(headers) {
            let bytes = reader.take(length).ok_or_else(|| truncated("item data"))?;
            if !code.is_ok() {
                resolved.push(Err(Error::resolution(&key.name, code.to_string())));
                continue;
            }
            let handle = Reader::new(bytes).u32().ok_or_else(|| truncated("symbol handle"))?;
            resolved.push(Ok(by_handle(key, handle)));
        }
        tracing::debug!(symbols = keys.len(), "resolved symbol batch");
        Ok(resolved)
    }
}
