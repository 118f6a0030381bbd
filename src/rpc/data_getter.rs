use std::sync::Arc;

use rkyv::{Archive, Archived, Deserialize, Serialize};

use crate::freeze::Freeze;
use crate::rpc::service::Service;


/// The request of the built-in 'give me a copy of your data' service
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum DataGetterRequest {
    GetData,
}

/// A service that lets any peer pull a replica of a value held by this process
pub struct DataGetter<T> {
    data: Arc<T>,
}

impl <T> DataGetter<T> {
    pub fn new(data: Arc<T>) -> DataGetter<T> {
        DataGetter { data }
    }
}

impl <T: Freeze + Clone> Service for DataGetter<T> {
    type Request = DataGetterRequest;
    type Response = T;

    fn handle_request(&self, request: &Archived<DataGetterRequest>) -> T {
        match request {
            ArchivedDataGetterRequest::GetData => (*self.data).clone(),
        }
    }
}


#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::freeze::freeze;

    use super::*;

    #[test]
    fn test_get_data_returns_copy() {
        let getter = DataGetter::new(Arc::new(vec![1u32, 2, 3]));
        let request = freeze(&DataGetterRequest::GetData).unwrap();

        let response = getter.handle_request(DataGetterRequest::thaw(&request).unwrap());
        assert_eq!(response, vec![1, 2, 3]);
    }
}
